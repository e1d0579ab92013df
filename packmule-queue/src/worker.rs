//! Process identity.

/// The `hostname[pid]` string identifying this process to the store.
///
/// Computed once at engine construction; it appears as `client` on pushed
/// jobs and as `worker` on claimed leases.
pub(crate) fn worker_id() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{host}[{}]", std::process::id())
}
