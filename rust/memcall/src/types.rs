/// Resource limit identifiers used with [`get_limit`](crate::get_limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    /// Maximum size of a core file.
    Core,

    /// Maximum number of bytes that may be locked into memory.
    MemLock,
}
