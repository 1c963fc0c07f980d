//! Best-effort process titles.

/// Longest name the kernel keeps for a task, excluding the NUL.
pub const MAX_TITLE_LEN: usize = 15;

/// Set the calling thread's name, which `ps`/`top` show for the main thread.
///
/// Silently does nothing where unsupported.
pub fn set_process_title(title: &str) {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		let name = std::ffi::CString::new(truncate(title, MAX_TITLE_LEN));
		match name {
			Ok(name) => {
				if let Err(e) = nix::sys::prctl::set_name(&name) {
					tracing::debug!("could not set process title: {}", e);
				}
			}
			Err(_) => tracing::debug!("process title contains a NUL byte, skipping"),
		}
	}
	#[cfg(not(any(target_os = "linux", target_os = "android")))]
	{
		let _ = title;
	}
}

/// Cut `s` to at most `max` bytes without splitting a character.
pub fn truncate(s: &str, max: usize) -> &str {
	if s.len() <= max {
		return s;
	}
	let mut end = max;
	while !s.is_char_boundary(end) {
		end -= 1;
	}
	&s[..end]
}
