//! Pure argv construction for the external inference binary.
//!
//! Grounded directly on `runtime/llamacpp.rs::generate_args`: no I/O, just a
//! parameter record folded into a flag list.

use std::path::{Path, PathBuf};

/// Everything needed to build one worker's command line. Mirrors the fields
/// named in §4.5/§6: model path (primary shard for sharded models), port,
/// context size, threads, GPU layers, sampling/runtime flags, optional
/// projector, and pass-through extra flags.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    pub port: u16,
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub flash_attention: bool,
    pub no_mmap: bool,
    pub mlock: bool,
    pub projector_path: Option<PathBuf>,
    pub executable_override: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for LoadRequest {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            port: 0,
            context_size: 4096,
            threads: 4,
            gpu_layers: 0,
            flash_attention: false,
            no_mmap: false,
            mlock: false,
            projector_path: None,
            executable_override: None,
            extra_args: Vec::new(),
        }
    }
}

/// Resolve the binary to exec: the request's override if set, else
/// `<binary_dir>/<inference_binary_name>`.
pub fn resolve_executable(binary_dir: &Path, inference_binary_name: &str, request: &LoadRequest) -> PathBuf {
    request
        .executable_override
        .clone()
        .unwrap_or_else(|| binary_dir.join(inference_binary_name))
}

/// Build the full argv (not including argv[0]) for `request`.
pub fn generate_args(request: &LoadRequest) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-m".to_string());
    args.push(request.model_path.display().to_string());

    args.push("--port".to_string());
    args.push(request.port.to_string());

    args.push("-c".to_string());
    args.push(request.context_size.to_string());

    args.push("--threads".to_string());
    args.push(request.threads.to_string());

    args.push("--n-gpu-layers".to_string());
    args.push(request.gpu_layers.to_string());

    if request.no_mmap {
        args.push("--no-mmap".to_string());
    }

    if request.mlock {
        args.push("--mlock".to_string());
    }

    if request.flash_attention {
        args.push("-fa".to_string());
        args.push("on".to_string());
    }

    if let Some(projector) = &request.projector_path {
        args.push("--mmproj".to_string());
        args.push(projector.display().to_string());
    }

    args.extend(request.extra_args.iter().cloned());

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_required_flags_in_order() {
        let request = LoadRequest {
            model_path: PathBuf::from("/models/a.gguf"),
            port: 8080,
            context_size: 2048,
            threads: 8,
            gpu_layers: 32,
            ..Default::default()
        };
        let args = generate_args(&request);
        assert_eq!(
            args,
            vec![
                "-m", "/models/a.gguf", "--port", "8080", "-c", "2048", "--threads", "8",
                "--n-gpu-layers", "32",
            ]
        );
    }

    #[test]
    fn optional_flags_are_only_present_when_set() {
        let request = LoadRequest {
            model_path: PathBuf::from("/models/a.gguf"),
            flash_attention: true,
            no_mmap: true,
            projector_path: Some(PathBuf::from("/models/mmproj-a.gguf")),
            extra_args: vec!["--verbose".to_string()],
            ..Default::default()
        };
        let args = generate_args(&request);
        assert!(args.contains(&"--no-mmap".to_string()));
        assert!(args.windows(2).any(|w| w == ["-fa", "on"]));
        assert!(args.windows(2).any(|w| w == ["--mmproj", "/models/mmproj-a.gguf"]));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(!args.contains(&"--mlock".to_string()));
    }

    #[test]
    fn executable_override_takes_precedence() {
        let request = LoadRequest {
            executable_override: Some(PathBuf::from("/opt/custom/server")),
            ..Default::default()
        };
        let resolved = resolve_executable(Path::new("/opt/bin"), "llama-server", &request);
        assert_eq!(resolved, PathBuf::from("/opt/custom/server"));
    }

    #[test]
    fn default_executable_joins_binary_dir_and_name() {
        let request = LoadRequest::default();
        let resolved = resolve_executable(Path::new("/opt/bin"), "llama-server", &request);
        assert_eq!(resolved, PathBuf::from("/opt/bin/llama-server"));
    }
}
