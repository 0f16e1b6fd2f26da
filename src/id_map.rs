use serde::Serialize;

/// One identity used inside the jail: `count` ids starting at `inside_id` are backed by the
/// host ids starting at `outside_id`.
#[derive(Clone, Debug, Copy, Eq, PartialEq, Serialize)]
pub struct IdMapping {
    pub inside_id: u32,
    pub outside_id: u32,
    pub count: u32,
}

impl IdMapping {
    /// Map a single host id to a single id inside the jail.
    pub fn one(outside_id: u32, inside_id: u32) -> IdMapping {
        IdMapping {
            inside_id,
            outside_id,
            count: 1,
        }
    }
}

/// An ordered set of id mappings, written to a user namespace's `uid_map` or `gid_map`.
#[derive(Clone, Debug, Default)]
pub struct IdMap {
    mappings: Vec<IdMapping>,
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap {
            mappings: Vec::new(),
        }
    }

    /// Create a mapping from the current UID to an inner UID.
    pub fn self_to_inner_uid(inner_uid: u32) -> IdMap {
        let uid = unsafe { libc::getuid() };
        let mut map = Self::new();
        map.map_one(uid, inner_uid);
        map
    }

    /// Create a mapping from the current GID to an inner GID.
    pub fn self_to_inner_gid(inner_gid: u32) -> IdMap {
        let gid = unsafe { libc::getgid() };
        let mut map = Self::new();
        map.map_one(gid, inner_gid);
        map
    }

    pub fn map_one(&mut self, outer_id: u32, inner_id: u32) {
        self.push(IdMapping::one(outer_id, inner_id));
    }

    /// Add a mapping, unless it maps nothing or its host range is already mapped.
    pub fn push(&mut self, mapping: IdMapping) {
        if mapping.count == 0 {
            return;
        }
        if self
            .mappings
            .iter()
            .any(|m| m.outside_id == mapping.outside_id)
        {
            return;
        }
        self.mappings.push(mapping);
    }

    /// Does this map only contain the caller's own id? Such maps can be written without a
    /// setuid helper.
    pub fn is_self_only(&self, own_id: u32) -> bool {
        matches!(self.mappings.as_slice(), [m] if m.outside_id == own_id && m.count == 1)
    }

    /// Format the [`IdMap`] in the style of a `/proc/PID/uid_map` or `/proc/PID/gid_map` file.
    pub fn into_idmap_file_contents(&self) -> String {
        let mut contents = String::new();
        for mapping in &self.mappings {
            contents.push_str(&format!(
                "{} {} {}\n",
                mapping.inside_id, mapping.outside_id, mapping.count
            ));
        }
        contents
    }

    /// Format the [`IdMap`] as the trailing arguments of `newuidmap(1)`/`newgidmap(1)`.
    pub fn helper_args(&self) -> Vec<String> {
        self.mappings
            .iter()
            .flat_map(|m| [m.inside_id, m.outside_id, m.count])
            .map(|id| id.to_string())
            .collect()
    }
}
