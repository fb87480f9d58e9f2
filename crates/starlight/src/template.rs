//! Scaffolds a new shader folder: one config plus default vertex and fragment
//! sources ready to compile.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Map;
use tracing::info;

use crate::config::{ConfigEntry, ConfigFile, CONFIG_SUFFIX};
use crate::error::JobError;

pub const VERTEX_SUFFIX: &str = ".spv.vert";
pub const FRAGMENT_SUFFIX: &str = ".spv.frag";

const DEFAULT_VERTEX_SHADER: &str = r"#version 450
layout(location = 0) in vec2 a_position;
layout(location = 0) out vec2 v_uv;

void main() {
    v_uv = a_position * 0.5 + vec2(0.5);
    gl_Position = vec4(a_position, 0.0, 1.0);
}
";

const DEFAULT_FRAGMENT_SHADER: &str = r"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

layout(binding = 0) uniform sampler2D inputImageTexture;

void main() {
    outColor = texture(inputImageTexture, v_uv);
}
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFiles {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

/// Creates `<dir>/<name>/` with `<name>.sl.json` and default shaders. A file
/// path for `dir` means its parent directory. Existing files are never
/// overwritten.
pub fn create_template(dir: &Path, name: &str) -> Result<TemplateFiles, JobError> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(JobError::InvalidName(name.to_string()));
    }
    let base = if dir.is_file() {
        dir.parent().unwrap_or(Path::new("."))
    } else {
        dir
    };

    let shader_dir = base.join(name);
    fs::create_dir_all(&shader_dir)?;

    let vertex_name = format!("{name}{VERTEX_SUFFIX}");
    let fragment_name = format!("{name}{FRAGMENT_SUFFIX}");
    let config = ConfigFile {
        namespace: Some("StarLight".into()),
        output_format: Some("ts".into()),
        data: vec![ConfigEntry {
            file_name: Some(name.to_string()),
            class_name: Some(to_big_camel(name)),
            vertex: vertex_name.clone(),
            fragment: fragment_name.clone(),
            stage: Some("both".into()),
            extra: Map::new(),
        }],
        extra: Map::new(),
    };

    let files = TemplateFiles {
        config: shader_dir.join(format!("{name}{CONFIG_SUFFIX}")),
        vertex: shader_dir.join(vertex_name),
        fragment: shader_dir.join(fragment_name),
        dir: shader_dir,
    };
    write_new(&files.config, config.to_json_pretty()?.as_bytes())?;
    write_new(&files.vertex, DEFAULT_VERTEX_SHADER.as_bytes())?;
    write_new(&files.fragment, DEFAULT_FRAGMENT_SHADER.as_bytes())?;

    info!(dir = %files.dir.display(), "created shader template");
    Ok(files)
}

/// `blur_pass` becomes `BlurPass`; a name without underscores only gets its
/// first letter upper-cased.
pub fn to_big_camel(name: &str) -> String {
    name.split('_').map(capitalize).collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn write_new(path: &Path, contents: &[u8]) -> Result<(), JobError> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    Ok(())
}
