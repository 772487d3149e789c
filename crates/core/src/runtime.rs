//! Locating external runtime pieces: the `ffmpeg`/`ffprobe` executables and the
//! ONNX Runtime shared library loaded by `ort` at session creation.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Library search order: `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the
/// system library directories on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        dirs.push(exe_dir.clone());
        dirs.push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

/// Executable search order: next to the binary, its `bin/` siblings, then the working
/// directory and its `bin/`. `PATH` is the fallback in [`command_for`].
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        dirs.push(exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("bin"));
        }
        dirs.insert(0, exe_dir);
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
        push_unique(&mut dirs, cwd);
    }
    dirs
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if binary.to_ascii_lowercase().ends_with(".exe") {
        return vec![binary.to_string()];
    }
    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Bundled copy of `binary` if one is found, otherwise `None` (resolved via `PATH`).
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    find_binary_in_dirs(binary, &candidate_bin_dirs())
}

pub fn command_for(binary: &str) -> ProcessCommand {
    match resolve_binary(binary) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Points `ort` at a bundled ONNX Runtime library unless `ORT_DYLIB_PATH` is already set.
///
/// Call at the very start of `main()`, before any session is created.
pub fn setup_runtime_libs() {
    if env::var_os("ORT_DYLIB_PATH").is_some() {
        return;
    }
    if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        env::set_var("ORT_DYLIB_PATH", &path);
    }
}

/// Log which runtime pieces were resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }

    for binary in ["ffmpeg", "ffprobe"] {
        match resolve_binary(binary) {
            Some(path) => info!("{binary}: {}", path.display()),
            None => info!("{binary}: resolved from PATH"),
        }
    }
}
