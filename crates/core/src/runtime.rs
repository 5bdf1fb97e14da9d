//! Locating external runtime pieces: the ffmpeg/ffprobe binaries and the
//! ONNX Runtime / CUDA shared libraries loaded at run time.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

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

/// `<exe>/`, `<exe>/bin`, `<exe>/../bin`, `<cwd>/`, `<cwd>/bin`.
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("bin"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.clone());
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then the system library dirs.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

fn binary_file_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = binary_file_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Command for a bundled binary, falling back to a `PATH` lookup.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load order for GPU runtime libraries: CUDA, then cuDNN, then TensorRT.
/// ONNX Runtime's own provider libraries are left to `ort`.
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

fn is_shared_lib(name: &str, path: &Path) -> bool {
    if cfg!(windows) {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// GPU runtime libraries found in `dirs`, ordered so dependencies come first.
/// The first directory holding a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_shared_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

// glibc caches LD_LIBRARY_PATH at startup, so libraries are opened by
// absolute path with RTLD_GLOBAL instead.
#[cfg(unix)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

/// Points `ORT_DYLIB_PATH` at a bundled ONNX Runtime and preloads CUDA
/// libraries. Call at the very start of `main`, before ORT is touched.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();
    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }
    for lib in collect_preload_libs(&dirs) {
        unsafe { load_library(&lib) };
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_bin_dirs_includes_cwd_bin() {
        let dirs = candidate_bin_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("bin")));
        }
    }

    #[test]
    fn find_binary_in_dirs_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");

        let binary_name = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
        std::fs::write(first.join(binary_name), b"first").expect("first binary should exist");
        std::fs::write(second.join(binary_name), b"second").expect("second binary should exist");

        let resolved = find_binary_in_dirs("ffmpeg", &[first.clone(), second])
            .expect("binary should be resolved");
        assert_eq!(resolved, first.join(binary_name));
    }

    #[test]
    fn find_binary_in_dirs_returns_none_when_missing() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        assert!(find_binary_in_dirs("ffprobe", &[temp.path().to_path_buf()]).is_none());
    }

    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("cublas64_12.dll") < load_priority("cudnn64_9.dll"));
        assert!(load_priority("libcudnn_ops.so.9") < load_priority("libnvinfer.so.10"));
    }

    #[test]
    fn load_priority_excludes_ort_and_unknown_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.23.2"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libvulkan.so.1"), None);
    }

    #[cfg(unix)]
    #[test]
    fn collect_preload_libs_orders_by_priority() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libcudart.so.12", "notes.txt"] {
            std::fs::write(temp.path().join(name), b"").expect("lib file should exist");
        }
        let libs = collect_preload_libs(&[temp.path().to_path_buf()]);
        let names: Vec<String> = libs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["libcudart.so.12", "libcudnn.so.9", "libnvinfer.so.10"]);
    }
}
