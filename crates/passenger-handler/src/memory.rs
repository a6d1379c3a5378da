//! Resident-set probe backing the memory ceiling.

/// Current resident set size in bytes, or 0 when it cannot be measured.
///
/// With a measurement of 0 the memory ceiling never triggers, which is the
/// safe direction: an unmeasurable worker keeps serving.
#[cfg(target_os = "linux")]
pub(crate) fn resident_set_size() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return 0;
    }
    pages.saturating_mul(page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn resident_set_size() -> u64 {
    0
}
