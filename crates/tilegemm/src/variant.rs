//! Kernel variant selection for the tiled GEMM.
//!
//! Every call runs exactly one specialised program, identified by a
//! [`KernelKey`]. The [`KernelTable`] maps the full key space to kernel
//! identifiers once, when a context is created.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GemmError, Result};
use crate::kernels::{KernelId, ProgramModule};

/// BLAS-style transpose flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transpose {
    #[default]
    NoTrans,
    Trans,
}

impl Transpose {
    pub fn is_trans(self) -> bool {
        matches!(self, Self::Trans)
    }

    pub fn flag(self) -> char {
        match self {
            Self::NoTrans => 'N',
            Self::Trans => 'T',
        }
    }
}

impl From<bool> for Transpose {
    fn from(trans: bool) -> Self {
        if trans { Self::Trans } else { Self::NoTrans }
    }
}

/// Output block computed by one work-item lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TileShape {
    /// 32 rows × 1 column per lane.
    #[default]
    #[serde(rename = "32x1")]
    Image32x1,
    /// 32 rows × 2 columns per lane.
    #[serde(rename = "32x2")]
    Image32x2,
}

impl TileShape {
    pub const ALL: [TileShape; 2] = [Self::Image32x1, Self::Image32x2];

    pub fn columns_per_lane(self) -> usize {
        match self {
            Self::Image32x1 => 1,
            Self::Image32x2 => 2,
        }
    }

    fn name_fragment(self) -> &'static str {
        match self {
            Self::Image32x1 => "32_1",
            Self::Image32x2 => "32_2",
        }
    }
}

impl fmt::Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image32x1 => write!(f, "32x1"),
            Self::Image32x2 => write!(f, "32x2"),
        }
    }
}

impl FromStr for TileShape {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "32x1" | "32_1" => Ok(Self::Image32x1),
            "32x2" | "32_2" => Ok(Self::Image32x2),
            other => Err(format!("unknown tile shape: {other}")),
        }
    }
}

/// How the compute kernel reads operand B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BRead {
    /// B not transposed, block image read with sub-group block reads.
    Blocked,
    /// B transposed, read directly from the strided buffer.
    TransposedBuffer,
    /// B transposed, read texel by texel from a scalar image.
    TransposedScalar,
}

impl BRead {
    pub const ALL: [BRead; 3] = [Self::Blocked, Self::TransposedBuffer, Self::TransposedScalar];

    /// Read mode for a call. `k` is the untiled inner dimension.
    pub fn select(trans_b: Transpose, b_is_image: bool, k: usize) -> Self {
        match trans_b {
            Transpose::NoTrans => Self::Blocked,
            Transpose::Trans if b_is_image || !k.is_multiple_of(8) => Self::TransposedScalar,
            Transpose::Trans => Self::TransposedBuffer,
        }
    }

    pub fn trans_b(self) -> Transpose {
        match self {
            Self::Blocked => Transpose::NoTrans,
            Self::TransposedBuffer | Self::TransposedScalar => Transpose::Trans,
        }
    }

    /// Whether the kernel binds B as an image.
    pub fn reads_image(self) -> bool {
        !matches!(self, Self::TransposedBuffer)
    }
}

/// Complete specialisation key of a GEMM kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub shape: TileShape,
    pub trans_a: Transpose,
    pub b_read: BRead,
    pub alpha_one: bool,
    pub beta_zero: bool,
}

impl KernelKey {
    /// Every key the table knows about.
    pub fn all() -> impl Iterator<Item = KernelKey> {
        TileShape::ALL.into_iter().flat_map(|shape| {
            [Transpose::NoTrans, Transpose::Trans]
                .into_iter()
                .flat_map(move |trans_a| {
                    BRead::ALL.into_iter().flat_map(move |b_read| {
                        [true, false].into_iter().flat_map(move |alpha_one| {
                            [true, false].into_iter().map(move |beta_zero| KernelKey {
                                shape,
                                trans_a,
                                b_read,
                                alpha_one,
                                beta_zero,
                            })
                        })
                    })
                })
        })
    }

    /// `gemm_{shape}_{A}{B}_[{BUFFER|SCALAR}_]{alpha==1}_{beta!=0}_float`
    pub fn program_name(&self) -> String {
        let mode = match self.b_read {
            BRead::Blocked => "",
            BRead::TransposedBuffer => "BUFFER_",
            BRead::TransposedScalar => "SCALAR_",
        };
        format!(
            "gemm_{}_{}{}_{}{}_{}_float",
            self.shape.name_fragment(),
            self.trans_a.flag(),
            self.b_read.trans_b().flag(),
            mode,
            u8::from(self.alpha_one),
            u8::from(!self.beta_zero),
        )
    }
}

/// Kernel identifiers for every [`KernelKey`].
#[derive(Debug, Clone)]
pub struct KernelTable {
    entries: HashMap<KernelKey, KernelId>,
}

impl KernelTable {
    pub fn builtin() -> Self {
        let entries = KernelKey::all()
            .map(|key| {
                (
                    key,
                    KernelId::new(ProgramModule::GemmImage, key.program_name()),
                )
            })
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, key: &KernelKey) -> Result<&KernelId> {
        self.entries
            .get(key)
            .ok_or_else(|| GemmError::invariant(format!("no kernel registered for {key:?}")))
    }

    /// Reverse lookup by program name.
    pub fn key_for(&self, name: &str) -> Option<KernelKey> {
        self.entries
            .iter()
            .find(|(_, id)| id.name() == name)
            .map(|(key, _)| *key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KernelKey, &KernelId)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(shape: TileShape, a: Transpose, b: BRead, alpha_one: bool, beta_zero: bool) -> KernelKey {
        KernelKey {
            shape,
            trans_a: a,
            b_read: b,
            alpha_one,
            beta_zero,
        }
    }

    #[test]
    fn names_follow_the_program_convention() {
        use BRead::*;
        use TileShape::*;
        use Transpose::*;
        assert_eq!(
            key(Image32x1, NoTrans, Blocked, true, true).program_name(),
            "gemm_32_1_NN_1_0_float"
        );
        assert_eq!(
            key(Image32x2, Trans, Blocked, false, false).program_name(),
            "gemm_32_2_TN_0_1_float"
        );
        assert_eq!(
            key(Image32x1, NoTrans, TransposedBuffer, true, false).program_name(),
            "gemm_32_1_NT_BUFFER_1_1_float"
        );
        assert_eq!(
            key(Image32x1, Trans, TransposedScalar, false, true).program_name(),
            "gemm_32_1_TT_SCALAR_0_0_float"
        );
    }

    #[test]
    fn table_is_exhaustive_and_injective() {
        let table = KernelTable::builtin();
        assert_eq!(table.len(), 2 * 2 * 3 * 2 * 2);
        let names: HashSet<_> = table.iter().map(|(_, id)| id.name().to_string()).collect();
        assert_eq!(names.len(), table.len());
        for key in KernelKey::all() {
            let id = table.lookup(&key).unwrap();
            assert_eq!(id.module(), ProgramModule::GemmImage);
            assert_eq!(table.key_for(id.name()), Some(key));
        }
    }

    #[test]
    fn transposed_b_read_mode() {
        assert_eq!(BRead::select(Transpose::NoTrans, false, 13), BRead::Blocked);
        assert_eq!(BRead::select(Transpose::NoTrans, true, 16), BRead::Blocked);
        assert_eq!(BRead::select(Transpose::Trans, false, 16), BRead::TransposedBuffer);
        assert_eq!(BRead::select(Transpose::Trans, false, 13), BRead::TransposedScalar);
        assert_eq!(BRead::select(Transpose::Trans, true, 16), BRead::TransposedScalar);
    }

    #[test]
    fn tile_shape_parses() {
        assert_eq!("32x2".parse::<TileShape>().unwrap(), TileShape::Image32x2);
        assert_eq!("32_1".parse::<TileShape>().unwrap(), TileShape::Image32x1);
        assert!("16x1".parse::<TileShape>().is_err());
    }
}
