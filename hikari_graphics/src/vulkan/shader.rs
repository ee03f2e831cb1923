/*! Shader source handling: include expansion, on-disk SPIR-V caching and
 * compilation through the GLSL frontend.
 *
 * Compiled binaries are cached keyed by a hash of the fully preprocessed
 * source string, so define or include changes recompile while unchanged
 * shaders load straight from disk.
 */

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use anyhow::{Context as _, Result};
use ash::vk;
use parking_lot::Mutex;

use super::reflection::{reflect_spirv, ShaderReflection};

const GLSL_VERSION_DIRECTIVE: &str = "#version 460";
const SHADER_INCLUDE_PRAGMA: &str = "#pragma INCLUDE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    ClosestHit,
    AnyHit,
    Intersection,
    Miss,
}

impl ShaderStage {
    fn to_glslang_extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Compute => "comp",
            Self::RayGeneration => "rgen",
            Self::ClosestHit => "rchit",
            Self::AnyHit => "rahit",
            Self::Intersection => "rint",
            Self::Miss => "rmiss",
        }
    }

    pub(crate) fn to_vulkan_stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
        }
    }
}

/// Explicit handle to the shader binary and reflection caches. One per
/// context; threaded through pipeline construction instead of being
/// process-wide state.
pub struct ShaderCache {
    binary_dir: PathBuf,
    reflections: Mutex<HashMap<u64, Arc<ShaderReflection>>>,
}

impl ShaderCache {
    pub fn new(binary_dir: &Path) -> Result<Self> {
        fs::create_dir_all(binary_dir)
            .with_context(|| format!("Failed to create shader cache dir {binary_dir:?}"))?;
        Ok(Self {
            binary_dir: binary_dir.to_owned(),
            reflections: Mutex::new(HashMap::new()),
        })
    }

    fn binary_path(&self, stem: &str, key: u64, extension: &str) -> PathBuf {
        self.binary_dir
            .join(format!("{stem}.{key:016x}.{extension}.spv"))
    }

    fn cached_reflection(&self, key: u64) -> Option<Arc<ShaderReflection>> {
        self.reflections.lock().get(&key).cloned()
    }

    fn insert_reflection(&self, key: u64, reflection: Arc<ShaderReflection>) {
        self.reflections.lock().insert(key, reflection);
    }
}

/// Compiled SPIR-V plus the reflected binding interface.
#[derive(Clone)]
pub struct ShaderSource {
    pub spirv: Vec<u32>,
    pub stage: ShaderStage,
    pub reflection: Arc<ShaderReflection>,
}

impl ShaderSource {
    pub fn new(
        cache: &ShaderCache,
        path: impl AsRef<Path>,
        stage: ShaderStage,
        defines: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let source = preprocess_shader_file(path, defines)?;
        let key = source_cache_key(&source);

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("shader");
        let binary_path = cache.binary_path(stem, key, stage.to_glslang_extension());

        let bytes = if binary_path.exists() {
            fs::read(&binary_path)
                .with_context(|| format!("Failed to read cached shader binary {binary_path:?}"))?
        } else {
            compile_through_glslang(&source, stage, &binary_path)?
        };

        let mut cursor = std::io::Cursor::new(bytes);
        let spirv = ash::util::read_spv(&mut cursor)?;

        let reflection = match cache.cached_reflection(key) {
            Some(reflection) => reflection,
            None => {
                let reflection = Arc::new(reflect_spirv(&spirv, stage.to_vulkan_stage_flags())?);
                cache.insert_reflection(key, reflection.clone());
                reflection
            }
        };

        Ok(Self {
            spirv,
            stage,
            reflection,
        })
    }

    pub(crate) fn create_module(&self, device: &ash::Device) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(&self.spirv);
        let module = unsafe { device.create_shader_module(&create_info, None)? };
        Ok(module)
    }
}

pub(crate) fn source_cache_key(preprocessed_source: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    preprocessed_source.hash(&mut hasher);
    hasher.finish()
}

/// Replaces include pragmas with the referenced file contents, drops nested
/// version directives and injects the defines right after the version line.
pub(crate) fn preprocess_shader_file(
    path: &Path,
    defines: &BTreeMap<String, String>,
) -> Result<String> {
    let base_path = path.parent().unwrap_or_else(|| Path::new(""));
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read shader source {path:?}"))?;

    let mut result = String::from(GLSL_VERSION_DIRECTIVE);
    result.push('\n');
    for (name, value) in defines {
        if value.is_empty() {
            result.push_str(&format!("#define {name}\n"));
        } else {
            result.push_str(&format!("#define {name} {value}\n"));
        }
    }
    result.push_str(&process_includes(&source, base_path)?);
    Ok(result)
}

fn process_includes(content: &str, base_path: &Path) -> Result<String> {
    let mut result = String::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(SHADER_INCLUDE_PRAGMA) {
            let start = rest.find('(').map(|i| i + 1).unwrap_or(rest.len());
            let end = rest.rfind(')').unwrap_or(start);
            let include_path = base_path.join(&rest[start..end]);
            let include_content = fs::read_to_string(&include_path)
                .with_context(|| format!("Failed to read shader include {include_path:?}"))?;
            result.push_str(&process_includes(
                &include_content,
                include_path.parent().unwrap_or(base_path),
            )?);
        } else if trimmed.starts_with("#version") {
            continue;
        } else {
            result.push_str(line);
            result.push('\n');
        }
    }
    Ok(result)
}

fn compile_through_glslang(
    source: &str,
    stage: ShaderStage,
    binary_path: &Path,
) -> Result<Vec<u8>> {
    let temp_path = binary_path.with_extension("glsl");
    fs::write(&temp_path, source)?;

    let command_name = match std::env::consts::OS {
        "windows" => "glslangValidator.exe",
        _ => "glslangValidator",
    };

    let output = Command::new(command_name)
        .arg(&temp_path)
        .arg("-V")
        .args(["--target-env", "vulkan1.2"])
        .args(["-S", stage.to_glslang_extension()])
        .arg("-o")
        .arg(binary_path)
        .output()
        .with_context(|| format!("Failed to run {command_name}"))?;

    let _ = fs::remove_file(&temp_path);

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Shader compilation failed:\n{stdout}\n{stderr}");
    }

    let bytes = fs::read(binary_path)
        .with_context(|| format!("Failed to read compiled shader binary {binary_path:?}"))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hikari_shader_test_{tag}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn preprocess_expands_includes_and_strips_versions() {
        let dir = temp_dir("includes");
        fs::write(dir.join("common.glsl"), "#version 460\nfloat common_fn() { return 1.0; }\n")
            .unwrap();
        fs::write(
            dir.join("main.comp"),
            "#version 460\n#pragma INCLUDE(common.glsl)\nvoid main() {}\n",
        )
        .unwrap();

        let source = preprocess_shader_file(&dir.join("main.comp"), &BTreeMap::new()).unwrap();
        assert!(source.starts_with(GLSL_VERSION_DIRECTIVE));
        assert!(source.contains("common_fn"));
        assert_eq!(source.matches("#version").count(), 1);
    }

    #[test]
    fn preprocess_injects_defines_after_version() {
        let dir = temp_dir("defines");
        fs::write(dir.join("main.comp"), "void main() {}\n").unwrap();

        let mut defines = BTreeMap::new();
        defines.insert(String::from("MAX_BOUNCES"), String::from("2"));
        defines.insert(String::from("USE_POSITION"), String::new());

        let source = preprocess_shader_file(&dir.join("main.comp"), &defines).unwrap();
        let version_at = source.find(GLSL_VERSION_DIRECTIVE).unwrap();
        let define_at = source.find("#define MAX_BOUNCES 2").unwrap();
        assert!(version_at < define_at);
        assert!(source.contains("#define USE_POSITION\n"));
    }

    #[test]
    fn cache_key_depends_on_defines_and_content() {
        let dir = temp_dir("keys");
        fs::write(dir.join("main.comp"), "void main() {}\n").unwrap();

        let base = preprocess_shader_file(&dir.join("main.comp"), &BTreeMap::new()).unwrap();
        let mut defines = BTreeMap::new();
        defines.insert(String::from("X"), String::from("1"));
        let defined = preprocess_shader_file(&dir.join("main.comp"), &defines).unwrap();

        assert_eq!(source_cache_key(&base), source_cache_key(&base));
        assert_ne!(source_cache_key(&base), source_cache_key(&defined));
    }
}
