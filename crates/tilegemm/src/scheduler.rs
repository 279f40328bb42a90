//! Tile plan over the `M×N×K` iteration space.
//!
//! The plan is a pure value: it only computes tile rectangles, padded K
//! extents and element offsets. Steps are ordered output row-block major,
//! then column-block, with the K blocks of one output tile consecutive so
//! that the first step of every tile initialises C and the rest accumulate.
//!
//! Operands are addressed physically. A transposed A is stored `K×M`, so
//! walking A along K moves down its rows rather than across its columns;
//! the same holds for a transposed B stored `N×K`.

use crate::error::{GemmError, Result};
use crate::variant::Transpose;

/// Sub-group width; padded K extents are multiples of it.
pub const SUB_GROUP_WIDTH: usize = 8;

pub const fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Logical problem shape plus operand layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmGeometry {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmGeometry {
    pub fn new(trans_a: Transpose, trans_b: Transpose, m: usize, n: usize, k: usize) -> Self {
        Self {
            trans_a,
            trans_b,
            m,
            n,
            k,
        }
    }

    /// Physical `(width, height)` of A.
    pub fn a_dims(&self) -> (usize, usize) {
        match self.trans_a {
            Transpose::NoTrans => (self.k, self.m),
            Transpose::Trans => (self.m, self.k),
        }
    }

    /// Physical `(width, height)` of B.
    pub fn b_dims(&self) -> (usize, usize) {
        match self.trans_b {
            Transpose::NoTrans => (self.n, self.k),
            Transpose::Trans => (self.k, self.n),
        }
    }

    pub fn lda(&self) -> usize {
        self.a_dims().0
    }

    pub fn ldb(&self) -> usize {
        self.b_dims().0
    }

    pub fn ldc(&self) -> usize {
        self.n
    }
}

/// Element offsets of the operands' first elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BaseOffsets {
    pub a: usize,
    pub b: usize,
    pub c: usize,
}

/// A rectangular region of a row-major matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub row: usize,
    pub col: usize,
    pub width: usize,
    pub height: usize,
}

impl TileRect {
    /// Element offset of the top-left corner.
    pub fn offset(&self, base: usize, ld: usize) -> usize {
        base + self.row * ld + self.col
    }
}

/// Everything needed to stage and dispatch one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStep {
    pub index: usize,
    pub row_block: usize,
    pub col_block: usize,
    pub k_block: usize,
    /// Output region.
    pub c: TileRect,
    /// Physical region of A read by this step.
    pub a: TileRect,
    /// Physical region of B read by this step.
    pub b: TileRect,
    /// K extent of this step.
    pub block_k: usize,
    pub padded_k: usize,
    pub first_k_block: bool,
    pub a_offset: usize,
    pub b_offset: usize,
    pub c_offset: usize,
    /// `(width, height)` of A's staged image when padded.
    pub a_padded: (usize, usize),
    /// `(width, height)` of B's staged image when padded.
    pub b_padded: (usize, usize),
}

/// Tiling of one GEMM call.
#[derive(Debug, Clone)]
pub struct TilePlan {
    geometry: GemmGeometry,
    tile_edge: usize,
    offsets: BaseOffsets,
    row_blocks: usize,
    col_blocks: usize,
    k_blocks: usize,
}

impl TilePlan {
    pub fn new(geometry: GemmGeometry, tile_edge: usize, offsets: BaseOffsets) -> Result<Self> {
        if tile_edge == 0 || !tile_edge.is_multiple_of(SUB_GROUP_WIDTH) {
            return Err(GemmError::invariant(format!(
                "tile edge {tile_edge} must be a positive multiple of {SUB_GROUP_WIDTH}"
            )));
        }
        let blocks = |extent: usize| extent.div_ceil(tile_edge);
        Ok(Self {
            geometry,
            tile_edge,
            offsets,
            row_blocks: blocks(geometry.m),
            col_blocks: blocks(geometry.n),
            k_blocks: blocks(geometry.k),
        })
    }

    pub fn geometry(&self) -> &GemmGeometry {
        &self.geometry
    }

    pub fn tile_edge(&self) -> usize {
        self.tile_edge
    }

    /// `(row blocks, column blocks, K blocks)`.
    pub fn grid(&self) -> (usize, usize, usize) {
        (self.row_blocks, self.col_blocks, self.k_blocks)
    }

    /// Number of compute launches.
    pub fn len(&self) -> usize {
        self.row_blocks * self.col_blocks * self.k_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn steps(&self) -> impl Iterator<Item = TileStep> + '_ {
        (0..self.len()).map(move |index| self.step(index))
    }

    /// The `index`-th step in dispatch order; `index < len()`.
    fn step(&self, index: usize) -> TileStep {
        let g = &self.geometry;
        let edge = self.tile_edge;
        let k_block = index % self.k_blocks;
        let col_block = (index / self.k_blocks) % self.col_blocks;
        let row_block = index / (self.k_blocks * self.col_blocks);

        let c = TileRect {
            row: row_block * edge,
            col: col_block * edge,
            width: (g.n - col_block * edge).min(edge),
            height: (g.m - row_block * edge).min(edge),
        };
        let k_start = k_block * edge;
        let block_k = (g.k - k_start).min(edge);
        let padded_k = round_up(block_k, SUB_GROUP_WIDTH);

        let (a, a_padded) = match g.trans_a {
            Transpose::NoTrans => (
                TileRect {
                    row: c.row,
                    col: k_start,
                    width: block_k,
                    height: c.height,
                },
                (padded_k, c.height),
            ),
            Transpose::Trans => (
                TileRect {
                    row: k_start,
                    col: c.row,
                    width: c.height,
                    height: block_k,
                },
                (c.height, padded_k),
            ),
        };
        let (b, b_padded) = match g.trans_b {
            Transpose::NoTrans => (
                TileRect {
                    row: k_start,
                    col: c.col,
                    width: c.width,
                    height: block_k,
                },
                (c.width, padded_k),
            ),
            Transpose::Trans => (
                TileRect {
                    row: c.col,
                    col: k_start,
                    width: block_k,
                    height: c.width,
                },
                (padded_k, c.width),
            ),
        };

        TileStep {
            index,
            row_block,
            col_block,
            k_block,
            c,
            a,
            b,
            block_k,
            padded_k,
            first_k_block: k_block == 0,
            a_offset: a.offset(self.offsets.a, g.lda()),
            b_offset: b.offset(self.offsets.b, g.ldb()),
            c_offset: c.offset(self.offsets.c, g.ldc()),
            a_padded,
            b_padded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Transpose::*;
    use proptest::prelude::*;

    fn plan(ta: Transpose, tb: Transpose, m: usize, n: usize, k: usize, edge: usize) -> TilePlan {
        TilePlan::new(GemmGeometry::new(ta, tb, m, n, k), edge, BaseOffsets::default()).unwrap()
    }

    #[test]
    fn cube_below_edge_is_one_tile() {
        let p = plan(NoTrans, NoTrans, 1000, 1000, 1000, 1024);
        assert_eq!(p.grid(), (1, 1, 1));
        let step = p.step(0);
        assert_eq!(step.block_k, 1000);
        assert_eq!(step.padded_k, 1000);
        assert_eq!(step.c.width, 1000);
        assert!(step.first_k_block);
    }

    #[test]
    fn empty_output_has_no_steps() {
        for (m, n) in [(0, 16), (16, 0)] {
            let p = plan(NoTrans, Trans, m, n, 16, 8);
            assert!(p.is_empty());
            assert_eq!(p.steps().count(), 0);
        }
    }

    #[test]
    fn ragged_cube_is_three_by_three_by_three() {
        let p = plan(NoTrans, NoTrans, 2500, 2500, 2500, 1024);
        assert_eq!(p.grid(), (3, 3, 3));
        assert_eq!(p.len(), 27);

        let last = p.step(26);
        assert_eq!((last.row_block, last.col_block, last.k_block), (2, 2, 2));
        assert_eq!(last.c.width, 452);
        assert_eq!(last.c.height, 452);
        assert_eq!(last.block_k, 452);
        assert_eq!(last.padded_k, 456);
        assert!(!last.first_k_block);
        assert_eq!(last.c_offset, 2048 * 2500 + 2048);
    }

    #[test]
    fn k_blocks_of_a_tile_are_consecutive() {
        let p = plan(NoTrans, NoTrans, 20, 20, 20, 8);
        let firsts: Vec<bool> = p.steps().take(4).map(|s| s.first_k_block).collect();
        assert_eq!(firsts, vec![true, false, false, true]);
        let s = p.step(1);
        assert_eq!((s.row_block, s.col_block, s.k_block), (0, 0, 1));
    }

    #[test]
    fn transposed_operands_advance_physically() {
        // A stored K×M, B stored N×K.
        let p = plan(Trans, Trans, 12, 20, 16, 8);
        let s = p.step(p.len() - 1);
        assert_eq!((s.row_block, s.col_block, s.k_block), (1, 2, 1));
        assert_eq!(s.a, TileRect { row: 8, col: 8, width: 4, height: 8 });
        assert_eq!(s.b, TileRect { row: 16, col: 8, width: 8, height: 4 });
        assert_eq!(s.a_offset, 8 * 12 + 8);
        assert_eq!(s.b_offset, 16 * 16 + 8);
        assert_eq!(s.a_padded, (4, 8));
        assert_eq!(s.b_padded, (8, 4));
    }

    #[test]
    fn base_offsets_are_added() {
        let g = GemmGeometry::new(NoTrans, NoTrans, 16, 16, 16);
        let p = TilePlan::new(g, 8, BaseOffsets { a: 5, b: 7, c: 11 }).unwrap();
        let s = p.step(3);
        assert_eq!((s.row_block, s.col_block, s.k_block), (0, 1, 1));
        assert_eq!(s.a_offset, 5 + 8);
        assert_eq!(s.b_offset, 7 + 8 * 16 + 8);
        assert_eq!(s.c_offset, 11 + 8);
    }

    #[test]
    fn rejects_unaligned_edge() {
        let g = GemmGeometry::new(NoTrans, NoTrans, 4, 4, 4);
        assert!(TilePlan::new(g, 12, BaseOffsets::default()).is_err());
        assert!(TilePlan::new(g, 0, BaseOffsets::default()).is_err());
    }

    #[test]
    fn empty_dimension_yields_no_steps() {
        let p = plan(NoTrans, NoTrans, 0, 16, 16, 8);
        assert!(p.is_empty());
        assert_eq!(p.steps().count(), 0);
    }

    fn transpose() -> impl Strategy<Value = Transpose> {
        prop_oneof![Just(NoTrans), Just(Trans)]
    }

    proptest! {
        #[test]
        fn prop_every_c_element_covered_once_per_k_block(
            ta in transpose(),
            tb in transpose(),
            m in 1usize..60,
            n in 1usize..60,
            k in 1usize..60,
            edge_mult in 1usize..5,
        ) {
            let edge = edge_mult * 8;
            let p = plan(ta, tb, m, n, k, edge);
            let mut hits = vec![0usize; m * n];
            let mut k_total = vec![0usize; m * n];
            for s in p.steps() {
                prop_assert!(s.c.width <= edge && s.c.height <= edge && s.block_k <= edge);
                prop_assert!(s.padded_k >= s.block_k && s.padded_k % 8 == 0 && s.padded_k - s.block_k < 8);
                for i in s.c.row..s.c.row + s.c.height {
                    for j in s.c.col..s.c.col + s.c.width {
                        if s.first_k_block {
                            hits[i * n + j] += 1;
                        }
                        k_total[i * n + j] += s.block_k;
                    }
                }
            }
            prop_assert!(hits.iter().all(|&h| h == 1));
            prop_assert!(k_total.iter().all(|&t| t == k));
        }

        #[test]
        fn prop_operand_regions_stay_in_bounds(
            ta in transpose(),
            tb in transpose(),
            m in 1usize..60,
            n in 1usize..60,
            k in 1usize..60,
        ) {
            let p = plan(ta, tb, m, n, k, 16);
            let g = *p.geometry();
            let (aw, ah) = g.a_dims();
            let (bw, bh) = g.b_dims();
            for s in p.steps() {
                prop_assert!(s.a.col + s.a.width <= aw && s.a.row + s.a.height <= ah);
                prop_assert!(s.b.col + s.b.width <= bw && s.b.row + s.b.height <= bh);
                prop_assert!(s.a_padded.0 >= s.a.width && s.a_padded.1 >= s.a.height);
                prop_assert!(s.b_padded.0 >= s.b.width && s.b_padded.1 >= s.b.height);
            }
        }
    }
}
