//! Per-OS run-loop implementations of [`crate::server::ServerControl`].
//!
//! Exactly one of these modules is compiled in; `RecommendedServer` is the
//! concrete type `Watcher` boxes behind the shared trait so the rest of the
//! crate never names a platform type directly.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxServer as RecommendedServer;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacServer as RecommendedServer;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::WindowsServer as RecommendedServer;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("sd-fs-watcher has no backend for this target platform");
