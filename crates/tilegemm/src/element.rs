//! Element types and the per-type capability table.
//!
//! Device buffers store 32-bit words; every [`Element`] knows how to map
//! itself onto a word and which [`KernelArg`] carries it as a scalar.

use std::collections::HashMap;
use std::fmt;

use half::f16;

use crate::device::KernelArg;
use crate::error::UnsupportedReason;
use crate::image::{ImageFormat, StagingFormats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    F32,
    F16,
    I32,
}

impl ElementKind {
    /// Suffix used in device program names.
    pub fn kernel_suffix(self) -> &'static str {
        match self {
            Self::F32 => "float",
            Self::F16 => "half",
            Self::I32 => "int",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::I32 => write!(f, "i32"),
        }
    }
}

/// Accelerated operations an element type may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    TiledGemm,
    Gemv,
    Axpy,
    Fill,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TiledGemm => write!(f, "tiled-gemm"),
            Self::Gemv => write!(f, "gemv"),
            Self::Axpy => write!(f, "axpy"),
            Self::Fill => write!(f, "fill"),
        }
    }
}

/// Scalar types the engine can move through device buffers.
pub trait Element: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: ElementKind;

    fn zero() -> Self;
    fn one() -> Self;
    fn to_word(self) -> u32;
    fn from_word(word: u32) -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn kernel_arg(self) -> KernelArg;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;

    fn zero() -> Self {
        0.0
    }
    fn one() -> Self {
        1.0
    }
    fn to_word(self) -> u32 {
        self.to_bits()
    }
    fn from_word(word: u32) -> Self {
        f32::from_bits(word)
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(value: f64) -> Self {
        value as f32
    }
    fn kernel_arg(self) -> KernelArg {
        KernelArg::Float(self)
    }
}

impl Element for f16 {
    const KIND: ElementKind = ElementKind::F16;

    fn zero() -> Self {
        f16::ZERO
    }
    fn one() -> Self {
        f16::ONE
    }
    fn to_word(self) -> u32 {
        u32::from(self.to_bits())
    }
    fn from_word(word: u32) -> Self {
        f16::from_bits(word as u16)
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
    fn kernel_arg(self) -> KernelArg {
        KernelArg::Half(self.to_bits())
    }
}

impl Element for i32 {
    const KIND: ElementKind = ElementKind::I32;

    fn zero() -> Self {
        0
    }
    fn one() -> Self {
        1
    }
    fn to_word(self) -> u32 {
        self as u32
    }
    fn from_word(word: u32) -> Self {
        word as i32
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(value: f64) -> Self {
        value as i32
    }
    fn kernel_arg(self) -> KernelArg {
        KernelArg::Int(self)
    }
}

/// Static facts about one element type.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementInfo {
    pub kind: ElementKind,
    pub size_bytes: usize,
    /// Format of staged images for block (sub-group) reads.
    pub block_image_format: Option<ImageFormat>,
    /// Format of staged images for scalar reads.
    pub scalar_image_format: Option<ImageFormat>,
    pub operations: Vec<Operation>,
}

impl ElementInfo {
    pub fn supports(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }

    /// Both staging formats, or `None` when either layout is missing.
    pub fn staging_formats(&self) -> Option<StagingFormats> {
        Some(StagingFormats {
            block: self.block_image_format?,
            scalar: self.scalar_image_format?,
        })
    }
}

/// Capability table, built once when a context is created.
#[derive(Debug, Clone)]
pub struct ElementTable {
    entries: HashMap<ElementKind, ElementInfo>,
}

impl ElementTable {
    pub fn builtin() -> Self {
        let entries = [
            ElementInfo {
                kind: ElementKind::F32,
                size_bytes: 4,
                block_image_format: Some(ImageFormat::BLOCK_READ),
                scalar_image_format: Some(ImageFormat::SCALAR_READ),
                operations: vec![
                    Operation::TiledGemm,
                    Operation::Gemv,
                    Operation::Axpy,
                    Operation::Fill,
                ],
            },
            ElementInfo {
                kind: ElementKind::F16,
                size_bytes: 2,
                block_image_format: None,
                scalar_image_format: Some(ImageFormat::SCALAR_READ_HALF),
                operations: Vec::new(),
            },
            ElementInfo {
                kind: ElementKind::I32,
                size_bytes: 4,
                block_image_format: None,
                scalar_image_format: None,
                operations: vec![Operation::Fill],
            },
        ]
        .into_iter()
        .map(|info| (info.kind, info))
        .collect();

        Self { entries }
    }

    /// Replace the entry for `info.kind`.
    pub fn with_entry(mut self, info: ElementInfo) -> Self {
        self.entries.insert(info.kind, info);
        self
    }

    pub fn info(&self, kind: ElementKind) -> Option<&ElementInfo> {
        self.entries.get(&kind)
    }

    pub fn staging_formats(&self, kind: ElementKind) -> Option<StagingFormats> {
        self.info(kind).and_then(ElementInfo::staging_formats)
    }

    pub fn supports(&self, kind: ElementKind, op: Operation) -> bool {
        self.info(kind).is_some_and(|info| info.supports(op))
    }

    /// Look up `kind`, failing with the reason reported to callers when
    /// `op` is not available for it.
    pub fn require(
        &self,
        kind: ElementKind,
        op: Operation,
    ) -> Result<&ElementInfo, UnsupportedReason> {
        self.info(kind)
            .filter(|info| info.supports(op))
            .ok_or(UnsupportedReason::ElementType { kind, op })
    }
}
