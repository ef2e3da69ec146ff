//! Host identity for cache metadata.

use std::ffi::CStr;
use std::mem::MaybeUninit;

use color_eyre::{Result, eyre::bail};

/// The hostname of the current machine, as reported by `uname(2)`.
///
/// Recorded in cache metadata so that an unexpectedly shared or poisoned
/// cache entry can be traced back to the machine that produced it.
pub fn hostname() -> Result<String> {
    let mut utsname = MaybeUninit::<libc::utsname>::uninit();

    // SAFETY: we pass a pointer to a properly sized utsname buffer, and only
    // read it after uname reports success.
    let result = unsafe { libc::uname(utsname.as_mut_ptr()) };
    if result != 0 {
        bail!("uname failed with code {result}");
    }

    let utsname = unsafe { utsname.assume_init() };
    let nodename = unsafe { CStr::from_ptr(utsname.nodename.as_ptr()) };
    Ok(nodename.to_string_lossy().into_owned())
}
