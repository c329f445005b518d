//! Index-space derivation for kernel dispatch.
//!
//! Given a kernel's execution class and its operand ranks, this module
//! computes how a point of the dispatch iteration space addresses each
//! operand: one affine [`IndexMap`] per operand, one [`IteratorRole`]
//! per iteration dimension, and one [`OperandConstraint`] per operand.
//! Everything here is pure — no graph access, no allocation beyond the
//! returned vectors — so the Dispatch Builder can call it mid-rewrite.
//!
//! The matmul derivation extends the output's rank-R space with one
//! contraction dimension (rank R+1) and projects it differently per
//! operand:
//!
//! ```text
//! iteration space (d0, ..., dR-3, dR-2, dR-1, dR)   dR = contraction
//! out (d0, ..., dR-1)          drop dR
//! lhs (d0, ..., dR-3, dR-2, dR) drop dR-1 (output column)
//! rhs (d0, ..., dR-3, dR, dR-1) drop dR-2 (output row), contraction
//!                               indexes the rhs row
//! ```

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::KernelKind;

/// An affine projection from the iteration space onto an operand's
/// index space: an ordered selection of iteration dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexMap {
    num_dims: usize,
    results: SmallVec<[usize; 6]>,
}

impl IndexMap {
    /// The identity map over `rank` dimensions.
    #[must_use]
    pub fn identity(rank: usize) -> Self {
        Self {
            num_dims: rank,
            results: (0..rank).collect(),
        }
    }

    /// Number of iteration-space dimensions this map consumes.
    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    /// The selected iteration dimensions, in operand-dimension order.
    #[must_use]
    pub fn results(&self) -> &[usize] {
        &self.results
    }

    /// Whether this is the identity map.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.num_dims == self.results.len()
            && self.results.iter().enumerate().all(|(i, &d)| i == d)
    }

    /// Drop the result at `pos`, keeping the iteration-space rank.
    #[must_use]
    pub fn drop_result(&self, pos: usize) -> Self {
        let mut results = self.results.clone();
        results.remove(pos);
        Self {
            num_dims: self.num_dims,
            results,
        }
    }

    /// Insert iteration dimension `dim` as a new result at `pos`.
    #[must_use]
    pub fn insert_result(&self, pos: usize, dim: usize) -> Self {
        let mut results = self.results.clone();
        results.insert(pos, dim);
        Self {
            num_dims: self.num_dims,
            results,
        }
    }

    /// Apply the map to an iteration-space point.
    #[must_use]
    pub fn apply(&self, point: &[usize]) -> SmallVec<[usize; 6]> {
        debug_assert_eq!(point.len(), self.num_dims);
        self.results.iter().map(|&d| point[d]).collect()
    }
}

impl std::fmt::Display for IndexMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims: Vec<String> = (0..self.num_dims).map(|d| format!("d{d}")).collect();
        let sel: Vec<String> = self.results.iter().map(|d| format!("d{d}")).collect();
        write!(f, "({}) -> ({})", dims.join(", "), sel.join(", "))
    }
}

/// Role of one iteration dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IteratorRole {
    /// Points along this dimension are independent.
    Parallel,
    /// This dimension is reduced over (fed through the systolic path).
    Systolic,
}

impl IteratorRole {
    /// The role's printed name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Systolic => "systolic",
        }
    }
}

/// Required physical granularity of a dispatch operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandConstraint {
    /// Any layout is acceptable.
    Any,
    /// The operand must already be tile-shaped.
    AnyTile,
}

impl OperandConstraint {
    /// The constraint's printed name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::AnyTile => "any_tile",
        }
    }
}

/// Failures of index-space derivation. The caller (the Dispatch
/// Builder) turns these into fatal [`crate::PassError`]s carrying the
/// offending node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Operands do not all share one rank.
    #[error("operands must share one rank")]
    RankMismatch,
    /// A matmul operand has rank below 2.
    #[error("matmul requires rank >= 2, got {0}")]
    MatmulRank(usize),
}

fn common_rank(operand_ranks: &[usize]) -> Result<usize, MapError> {
    let Some((&first, rest)) = operand_ranks.split_first() else {
        return Err(MapError::RankMismatch);
    };
    if rest.iter().any(|&r| r != first) {
        return Err(MapError::RankMismatch);
    }
    Ok(first)
}

/// Index maps and iterator roles for a kernel of the given kind over
/// operands of the given ranks (inputs followed by the output).
///
/// # Errors
///
/// [`MapError::RankMismatch`] if the operand ranks differ (both kinds
/// currently require a single common rank), [`MapError::MatmulRank`]
/// if a matmul operand has rank below 2.
pub fn kernel_maps(
    kind: KernelKind,
    operand_ranks: &[usize],
) -> Result<(Vec<IndexMap>, Vec<IteratorRole>), MapError> {
    match kind {
        KernelKind::Eltwise => eltwise_maps(operand_ranks),
        KernelKind::Matmul => matmul_maps(operand_ranks),
    }
}

/// Identity maps and all-parallel roles over the operands' common rank.
fn eltwise_maps(
    operand_ranks: &[usize],
) -> Result<(Vec<IndexMap>, Vec<IteratorRole>), MapError> {
    let rank = common_rank(operand_ranks)?;
    let maps = vec![IndexMap::identity(rank); operand_ranks.len()];
    let roles = vec![IteratorRole::Parallel; rank];
    Ok((maps, roles))
}

/// Matmul maps over an iteration space of rank R+1, the added inner
/// dimension being the contraction.
fn matmul_maps(
    operand_ranks: &[usize],
) -> Result<(Vec<IndexMap>, Vec<IteratorRole>), MapError> {
    let rank = common_rank(operand_ranks)?;
    if rank < 2 {
        return Err(MapError::MatmulRank(rank));
    }
    let space = rank + 1;

    // (d0, .., dR) with dR-2 = out row, dR-1 = out col, dR = contraction.
    let id = IndexMap::identity(space);
    let lhs = id.drop_result(space - 2);
    let rhs = id.drop_result(space - 3);
    // Move the output-column dim behind the contraction dim: the
    // contraction indexes the rhs's row, the output column its column.
    let rhs_outer = rhs.results()[rank - 2];
    let rhs = rhs.insert_result(rank, rhs_outer).drop_result(rank - 2);
    let out = id.drop_result(space - 1);

    let mut roles = vec![IteratorRole::Parallel; rank];
    roles.push(IteratorRole::Systolic);
    Ok((vec![lhs, rhs, out], roles))
}

/// Tiling constraint per operand for a kernel of the given kind.
///
/// Total over every kind [`kernel_maps`] accepts; an elementwise
/// kernel accepts any granularity, a matmul requires tile-shaped
/// operands on this target.
#[must_use]
pub fn operand_constraints(kind: KernelKind, num_operands: usize) -> Vec<OperandConstraint> {
    let c = match kind {
        KernelKind::Eltwise => OperandConstraint::Any,
        KernelKind::Matmul => OperandConstraint::AnyTile,
    };
    vec![c; num_operands]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_map() {
        let m = IndexMap::identity(3);
        assert!(m.is_identity());
        assert_eq!(m.to_string(), "(d0, d1, d2) -> (d0, d1, d2)");
        assert_eq!(m.apply(&[7, 8, 9]).as_slice(), &[7, 8, 9]);
    }

    #[test]
    fn test_eltwise_maps_all_identity_all_parallel() {
        for n in 1..=4 {
            let ranks = vec![2usize; n];
            let (maps, roles) = kernel_maps(KernelKind::Eltwise, &ranks).unwrap();
            assert_eq!(maps.len(), n);
            assert!(maps.iter().all(IndexMap::is_identity));
            assert_eq!(roles, vec![IteratorRole::Parallel; 2]);
        }
    }

    #[test]
    fn test_eltwise_rank_mismatch() {
        let err = kernel_maps(KernelKind::Eltwise, &[2, 3, 2]).unwrap_err();
        assert_eq!(err, MapError::RankMismatch);
    }

    #[test]
    fn test_matmul_maps_rank2() {
        // R = 2: space (d0, d1, d2), d0 = row, d1 = col, d2 = contraction.
        let (maps, roles) = kernel_maps(KernelKind::Matmul, &[2, 2, 2]).unwrap();
        let [lhs, rhs, out] = maps.as_slice() else {
            panic!("expected three maps");
        };

        assert_eq!(lhs.results(), &[0, 2]);
        assert_eq!(rhs.results(), &[2, 1]);
        assert_eq!(out.results(), &[0, 1]);
        assert_eq!(
            roles,
            vec![
                IteratorRole::Parallel,
                IteratorRole::Parallel,
                IteratorRole::Systolic
            ]
        );
    }

    #[test]
    fn test_matmul_maps_batched_rank3() {
        // R = 3: space (d0, d1, d2, d3), d0 batch, d3 contraction.
        let (maps, roles) = kernel_maps(KernelKind::Matmul, &[3, 3, 3]).unwrap();
        let [lhs, rhs, out] = maps.as_slice() else {
            panic!("expected three maps");
        };

        assert_eq!(lhs.results(), &[0, 1, 3]);
        assert_eq!(rhs.results(), &[0, 3, 2]);
        assert_eq!(out.results(), &[0, 1, 2]);

        assert_eq!(roles.len(), 4);
        assert_eq!(
            roles.iter().filter(|&&r| r == IteratorRole::Systolic).count(),
            1
        );
        assert_eq!(roles[3], IteratorRole::Systolic);
    }

    #[test]
    fn test_matmul_maps_drop_exactly_one_dim() {
        for rank in 2..=5 {
            let (maps, _) = kernel_maps(KernelKind::Matmul, &[rank, rank, rank]).unwrap();
            let space = rank + 1;
            let [lhs, rhs, out] = maps.as_slice() else {
                panic!("expected three maps");
            };

            // out drops exactly the contraction dim.
            assert!(!out.results().contains(&(space - 1)));
            // lhs drops exactly the output-column dim.
            assert!(!lhs.results().contains(&(space - 2)));
            // rhs drops exactly the output-row dim.
            assert!(!rhs.results().contains(&(space - 3)));
            for m in maps {
                assert_eq!(m.results().len(), rank);
                assert_eq!(m.num_dims(), space);
            }
        }
    }

    #[test]
    fn test_matmul_rank_too_low() {
        let err = kernel_maps(KernelKind::Matmul, &[1, 1, 1]).unwrap_err();
        assert_eq!(err, MapError::MatmulRank(1));
    }

    #[test]
    fn test_matmul_addressing_semantics() {
        // C[i, j] += A[i, k] * B[k, j]: at iteration point (i, j, k)
        // the maps must address A, B and C exactly like that.
        let (maps, _) = kernel_maps(KernelKind::Matmul, &[2, 2, 2]).unwrap();
        let (i, j, k) = (4, 5, 6);
        assert_eq!(maps[0].apply(&[i, j, k]).as_slice(), &[i, k]);
        assert_eq!(maps[1].apply(&[i, j, k]).as_slice(), &[k, j]);
        assert_eq!(maps[2].apply(&[i, j, k]).as_slice(), &[i, j]);
    }

    #[test]
    fn test_constraints_per_kind() {
        assert_eq!(
            operand_constraints(KernelKind::Eltwise, 3),
            vec![OperandConstraint::Any; 3]
        );
        assert_eq!(
            operand_constraints(KernelKind::Matmul, 3),
            vec![OperandConstraint::AnyTile; 3]
        );
    }
}
