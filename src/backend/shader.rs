// Shader compilation and module creation
//
// Vulkan consumes SPIR-V. Sources are compiled by an external tool (glslc
// or dxc from the Vulkan SDK); the result is handed to the pipeline builder
// as opaque words and turned into short-lived shader modules.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::{CString, OsString};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::tracker::ResourceKind;
use super::VulkanDevice;
use crate::config::CompilerTool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
        }
    }
}

/// One shader source to compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    pub path: PathBuf,
    pub entry_point: String,
    /// Target profile: `vs_6_0` style for dxc, a `--target-env` for glslc
    pub profile: String,
}

/// SPIR-V ready to become a shader module
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub entry_point: CString,
    pub code: Vec<u32>,
}

/// Anything that can turn a [`ShaderSource`] into SPIR-V
pub trait ShaderCompiler {
    fn compile(&self, source: &ShaderSource) -> Result<CompiledShader>;
}

/// Runs `glslc` or `dxc` as a child process
pub struct ExternalCompiler {
    tool: CompilerTool,
    output_dir: PathBuf,
}

impl ExternalCompiler {
    /// Writes SPIR-V under a temp directory owned by this process
    pub fn new(tool: CompilerTool) -> Self {
        Self {
            tool,
            output_dir: std::env::temp_dir().join(format!("rocket-shaders-{}", std::process::id())),
        }
    }

    pub fn with_output_dir(tool: CompilerTool, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            output_dir: output_dir.into(),
        }
    }

    fn program(&self) -> &'static str {
        match self.tool {
            CompilerTool::Glslc => "glslc",
            CompilerTool::Dxc => "dxc",
        }
    }

    fn output_path(&self, source: &ShaderSource) -> PathBuf {
        let stem = source
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shader".to_string());
        self.output_dir
            .join(format!("{}.{}.spv", stem, source.stage.short_name()))
    }

    fn arguments(&self, source: &ShaderSource, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self.tool {
            CompilerTool::Glslc => {
                args.push(format!("-fshader-stage={}", source.stage.short_name()).into());
                args.push(format!("-fentry-point={}", source.entry_point).into());
                args.push(format!("--target-env={}", source.profile).into());
                args.push("-o".into());
                args.push(output.into());
            }
            CompilerTool::Dxc => {
                args.push("-spirv".into());
                args.push("-fvk-use-dx-layout".into());
                args.push("-E".into());
                args.push(source.entry_point.clone().into());
                args.push("-T".into());
                args.push(source.profile.clone().into());
                args.push("-Fo".into());
                args.push(output.into());
            }
        }
        args.push(source.path.clone().into());
        args
    }
}

impl ShaderCompiler for ExternalCompiler {
    fn compile(&self, source: &ShaderSource) -> Result<CompiledShader> {
        let entry_point = CString::new(source.entry_point.as_str())
            .context("Shader entry point contains a NUL byte")?;

        // Already compiled offline
        if source.path.extension().is_some_and(|ext| ext == "spv") {
            let bytes = std::fs::read(&source.path)
                .with_context(|| format!("Failed to read SPIR-V file {:?}", source.path))?;
            return Ok(CompiledShader {
                stage: source.stage,
                entry_point,
                code: spirv_from_bytes(&bytes)?,
            });
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create shader output directory {:?}", self.output_dir))?;
        let output = self.output_path(source);
        let result = Command::new(self.program())
            .args(self.arguments(source, &output))
            .output()
            .with_context(|| {
                format!(
                    "Failed to run {} (is the Vulkan SDK installed?)",
                    self.program()
                )
            })?;

        if !result.status.success() {
            anyhow::bail!(
                "Shader compilation failed for {:?}:\n{}",
                source.path,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        let bytes = std::fs::read(&output)
            .with_context(|| format!("Failed to read compiled shader {:?}", output))?;
        log::info!("Compiled {:?} ({} bytes)", source.path, bytes.len());

        Ok(CompiledShader {
            stage: source.stage,
            entry_point,
            code: spirv_from_bytes(&bytes)?,
        })
    }
}

/// Decode SPIR-V bytes into words, fixing up byte order if needed
pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V binary")
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    let module = unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")?
    };
    device.tracker.created(ResourceKind::ShaderModule);
    Ok(module)
}

pub fn destroy_shader_module(device: &VulkanDevice, module: vk::ShaderModule) {
    unsafe { device.device.destroy_shader_module(module, None) };
    device.tracker.destroyed(ResourceKind::ShaderModule);
}
