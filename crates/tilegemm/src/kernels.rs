//! Device program modules and kernel identifiers.

use std::fmt;
use std::sync::Arc;

use crate::element::ElementKind;

/// Program source a kernel is compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramModule {
    /// Tiled GEMM variants and the buffer→image conversion kernels.
    GemmImage,
    MatvecMul,
    /// Vector math (`axpy`).
    Math,
    FillBuffer,
}

impl ProgramModule {
    pub const ALL: [ProgramModule; 4] = [
        Self::GemmImage,
        Self::MatvecMul,
        Self::Math,
        Self::FillBuffer,
    ];

    pub fn source_name(self) -> &'static str {
        match self {
            Self::GemmImage => "gemm_image",
            Self::MatvecMul => "matvec_mul",
            Self::Math => "math",
            Self::FillBuffer => "fillbuffer",
        }
    }
}

impl fmt::Display for ProgramModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_name())
    }
}

/// Fully qualified kernel name. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelId {
    module: ProgramModule,
    name: Arc<str>,
}

impl KernelId {
    pub fn new(module: ProgramModule, name: impl Into<Arc<str>>) -> Self {
        Self {
            module,
            name: name.into(),
        }
    }

    pub fn module(&self) -> ProgramModule {
        self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

/// Strided copy into an RGBA×UINT8 block image, zero-filling any padding.
pub const COPY_IMAGE_NO_TRANSPOSE: &str = "gemm_buffer_copy_image_no_transpose_float";
/// Strided copy into an R×FLOAT scalar image.
pub const COPY_IMAGE_TRANSPOSE: &str = "gemm_buffer_copy_image_transpose_float";

pub fn copy_to_image(scalar_layout: bool) -> KernelId {
    let name = if scalar_layout {
        COPY_IMAGE_TRANSPOSE
    } else {
        COPY_IMAGE_NO_TRANSPOSE
    };
    KernelId::new(ProgramModule::GemmImage, name)
}

pub fn matvec_mul4(kind: ElementKind) -> KernelId {
    KernelId::new(
        ProgramModule::MatvecMul,
        format!("matvec_mul4_{}", kind.kernel_suffix()),
    )
}

pub fn matvec_mul1(kind: ElementKind) -> KernelId {
    KernelId::new(
        ProgramModule::MatvecMul,
        format!("matvec_mul1_{}", kind.kernel_suffix()),
    )
}

pub fn axpy(kind: ElementKind) -> KernelId {
    KernelId::new(ProgramModule::Math, format!("axpy_{}", kind.kernel_suffix()))
}

pub fn fill(kind: ElementKind) -> KernelId {
    KernelId::new(
        ProgramModule::FillBuffer,
        format!("fill_{}", kind.kernel_suffix()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_kernel_names() {
        assert_eq!(matvec_mul4(ElementKind::F32).name(), "matvec_mul4_float");
        assert_eq!(matvec_mul1(ElementKind::F32).name(), "matvec_mul1_float");
        assert_eq!(axpy(ElementKind::F32).module(), ProgramModule::Math);
        assert_eq!(fill(ElementKind::I32).name(), "fill_int");
    }

    #[test]
    fn copy_kernel_by_layout() {
        assert_eq!(copy_to_image(true).name(), COPY_IMAGE_TRANSPOSE);
        assert_eq!(copy_to_image(false).name(), COPY_IMAGE_NO_TRANSPOSE);
        assert_eq!(
            copy_to_image(false).to_string(),
            "gemm_image::gemm_buffer_copy_image_no_transpose_float"
        );
    }
}
