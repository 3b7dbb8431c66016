use crate::error::ArgumentError;

/// Split of an MPI job around the one rank that runs under the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankPlacementPlan {
    pub total_ranks: u32,
    pub traced_rank: u32,
    pub ranks_before: u32,
    pub ranks_after: u32,
}

/// `ranks_before + 1 + ranks_after == total_ranks` for every accepted input.
pub fn plan(total_ranks: i64, traced_rank: i64) -> Result<RankPlacementPlan, ArgumentError> {
    if total_ranks < 1 {
        return Err(ArgumentError::NonPositiveRanks(total_ranks));
    }
    if traced_rank < 0 || traced_rank >= total_ranks {
        return Err(ArgumentError::TracedRankOutOfRange { rank: traced_rank, total: total_ranks });
    }
    let total = u32::try_from(total_ranks).map_err(|_| ArgumentError::NotANumber {
        name: "<nprocs>",
        value: total_ranks.to_string(),
    })?;
    let traced = traced_rank as u32;

    Ok(RankPlacementPlan {
        total_ranks: total,
        traced_rank: traced,
        ranks_before: traced,
        ranks_after: total.saturating_sub(traced + 1),
    })
}
