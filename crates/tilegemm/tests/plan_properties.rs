//! Property tests for the tile plan.

use proptest::prelude::*;
use tilegemm::scheduler::BaseOffsets;
use tilegemm::{GemmGeometry, TilePlan, Transpose};

fn transpose() -> impl Strategy<Value = Transpose> {
    prop_oneof![Just(Transpose::NoTrans), Just(Transpose::Trans)]
}

proptest! {
    #[test]
    fn every_output_element_is_covered_once_per_k_block(
        ta in transpose(),
        tb in transpose(),
        m in 1usize..70,
        n in 1usize..70,
        k in 1usize..70,
        edge in prop_oneof![Just(8usize), Just(16), Just(32)],
    ) {
        let plan = TilePlan::new(GemmGeometry::new(ta, tb, m, n, k), edge, BaseOffsets::default()).unwrap();
        let (_, _, k_blocks) = plan.grid();
        let mut hits = vec![0usize; m * n];
        let mut k_covered = vec![0usize; m * n];
        for step in plan.steps() {
            prop_assert!(step.c.width >= 1 && step.c.width <= edge);
            prop_assert!(step.c.height >= 1 && step.c.height <= edge);
            prop_assert_eq!(step.padded_k % 8, 0);
            prop_assert!(step.padded_k >= step.block_k && step.padded_k < step.block_k + 8);
            prop_assert_eq!(step.first_k_block, step.k_block == 0);
            for row in step.c.row..step.c.row + step.c.height {
                for col in step.c.col..step.c.col + step.c.width {
                    hits[row * n + col] += 1;
                    k_covered[row * n + col] += step.block_k;
                }
            }
        }
        prop_assert!(hits.iter().all(|&h| h == k_blocks));
        prop_assert!(k_covered.iter().all(|&kc| kc == k));
    }

    #[test]
    fn operand_regions_stay_inside_their_matrices(
        ta in transpose(),
        tb in transpose(),
        m in 1usize..50,
        n in 1usize..50,
        k in 1usize..50,
    ) {
        let geometry = GemmGeometry::new(ta, tb, m, n, k);
        let plan = TilePlan::new(geometry, 8, BaseOffsets { a: 3, b: 5, c: 7 }).unwrap();
        let (a_width, a_height) = geometry.a_dims();
        let (b_width, b_height) = geometry.b_dims();
        for step in plan.steps() {
            prop_assert!(step.a.col + step.a.width <= a_width);
            prop_assert!(step.a.row + step.a.height <= a_height);
            prop_assert!(step.b.col + step.b.width <= b_width);
            prop_assert!(step.b.row + step.b.height <= b_height);
            prop_assert_eq!(step.a_offset, step.a.offset(3, geometry.lda()));
            prop_assert_eq!(step.b_offset, step.b.offset(5, geometry.ldb()));
            prop_assert_eq!(step.c_offset, step.c.offset(7, geometry.ldc()));
        }
    }

    #[test]
    fn k_blocks_of_one_tile_are_consecutive(
        m in 1usize..40,
        n in 1usize..40,
        k in 1usize..40,
    ) {
        let plan = TilePlan::new(
            GemmGeometry::new(Transpose::NoTrans, Transpose::NoTrans, m, n, k),
            8,
            BaseOffsets::default(),
        )
        .unwrap();
        let steps: Vec<_> = plan.steps().collect();
        for pair in steps.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if !next.first_k_block {
                prop_assert_eq!((prev.row_block, prev.col_block), (next.row_block, next.col_block));
                prop_assert_eq!(prev.k_block + 1, next.k_block);
            } else {
                prop_assert!((next.row_block, next.col_block) > (prev.row_block, prev.col_block));
            }
        }
    }
}
