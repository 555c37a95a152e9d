// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V lookup: embedded at build time, or loaded from a directory.

use std::borrow::Cow;
use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use kestrel_core::read_binary_file;
use tracing::debug;

use crate::error::VkError;

const EMBEDDED: &[(&str, &[u8])] = &[
    (
        "tri.vert",
        include_bytes!(concat!(env!("OUT_DIR"), "/tri.vert.spv")),
    ),
    (
        "tri.frag",
        include_bytes!(concat!(env!("OUT_DIR"), "/tri.frag.spv")),
    ),
    (
        "quad.vert",
        include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv")),
    ),
    (
        "quad.frag",
        include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv")),
    ),
];

#[derive(Clone, Debug, Default)]
pub struct ShaderLibrary {
    /// `<dir>/<name>.spv` overrides the embedded blobs when set.
    dir: Option<PathBuf>,
}

impl ShaderLibrary {
    pub fn embedded() -> Self {
        Self { dir: None }
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<Cow<'static, [u8]>> {
        match &self.dir {
            Some(dir) => {
                let path = dir.join(format!("{name}.spv"));
                let bytes = read_binary_file(&path)
                    .with_context(|| format!("shader `{name}`"))?;
                Ok(Cow::Owned(bytes))
            }
            None => EMBEDDED
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, bytes)| Cow::Borrowed(*bytes))
                .ok_or_else(|| anyhow!("no embedded shader named `{name}`")),
        }
    }

    pub fn words(&self, name: &str) -> Result<Vec<u32>> {
        let bytes = self.bytes(name)?;
        read_spv(&mut Cursor::new(&bytes[..])).with_context(|| format!("decode SPIR-V `{name}`"))
    }

    pub unsafe fn create_module(&self, device: &ash::Device, name: &str) -> Result<vk::ShaderModule> {
        let code = self.words(name)?;
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            p_code: code.as_ptr(),
            code_size: code.len() * 4,
            ..Default::default()
        };
        let module = device
            .create_shader_module(&ci, None)
            .map_err(|result| VkError::ShaderModule {
                name: name.to_owned(),
                result,
            })?;
        debug!("shader module `{name}` ({} words)", code.len());
        Ok(module)
    }
}
