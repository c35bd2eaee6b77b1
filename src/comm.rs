//! Recognizing message-passing library calls by name.
//!
//! Both the C binding names (`MPI_Allreduce`) and the Fortran binding names
//! (`mpi_allreduce_`) are recognized; the latter is the older scheme that
//! legacy profiles were recorded with.

use serde::{Deserialize, Serialize};

/// The cost category of a communication operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommCategory {
    /// A single transfer between two processes.
    PointToPoint,
    /// A rooted reduction.
    Reduce,
    /// A reduction whose result every process receives.
    AllReduce,
    /// Any other collective operation.
    Collective,
    /// Completion and synchronization: waits and barriers.
    Wait,
    /// Environment management: init, finalize, rank and size queries.
    Setup,
}

impl CommCategory {
    /// Is this category priced by the latency/bandwidth model?
    pub fn is_modeled(self) -> bool {
        matches!(
            self,
            CommCategory::PointToPoint
                | CommCategory::Reduce
                | CommCategory::AllReduce
                | CommCategory::Collective
        )
    }

    /// The multiplier applied to the bandwidth term of reductions.
    pub fn reduce_constant(self) -> f64 {
        match self {
            CommCategory::AllReduce => 2.0,
            _ => 1.0,
        }
    }
}

/// A recognized communication operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommOp {
    /// The normalized, lowercase operation name, e.g. `allreduce`.
    pub stem: &'static str,
    /// How this operation is priced.
    pub category: CommCategory,
    /// Argument positions of the element count and the datatype, for
    /// operations that move data.
    pub payload: Option<(usize, usize)>,
}

macro_rules! ops {
    (@payload ($count:literal, $dt:literal)) => { Some(($count, $dt)) };
    (@payload) => { None };
    ($($stem:literal => $cat:ident $(($count:literal, $dt:literal))?,)*) => {
        const OPS: &[CommOp] = &[
            $(CommOp {
                stem: $stem,
                category: CommCategory::$cat,
                payload: ops!(@payload $(($count, $dt))?),
            },)*
        ];
    };
}

ops! {
    "send" => PointToPoint(1, 2),
    "ssend" => PointToPoint(1, 2),
    "bsend" => PointToPoint(1, 2),
    "rsend" => PointToPoint(1, 2),
    "isend" => PointToPoint(1, 2),
    "recv" => PointToPoint(1, 2),
    "irecv" => PointToPoint(1, 2),
    "sendrecv" => PointToPoint(1, 2),
    "reduce" => Reduce(2, 3),
    "allreduce" => AllReduce(2, 3),
    "bcast" => Collective(1, 2),
    "gather" => Collective(1, 2),
    "scatter" => Collective(1, 2),
    "allgather" => Collective(1, 2),
    "alltoall" => Collective(1, 2),
    "wait" => Wait,
    "waitall" => Wait,
    "barrier" => Wait,
    "init" => Setup,
    "finalize" => Setup,
    "comm_rank" => Setup,
    "comm_size" => Setup,
}

impl CommOp {
    /// Look up the operation a callee name refers to.
    pub fn lookup(callee: &str) -> Option<CommOp> {
        let stem = normalize(callee)?;
        OPS.iter().copied().find(|op| op.stem == stem)
    }

    /// Does this operation move a payload that the byte counter can trap?
    pub fn moves_data(&self) -> bool {
        self.category.is_modeled() && self.payload.is_some()
    }

    /// Is this the environment's rank query?
    pub fn is_rank_query(&self) -> bool {
        self.stem == "comm_rank"
    }
}

/// Strip the binding-specific decoration from a communication call name.
///
/// `MPI_Comm_rank` and `mpi_comm_rank_` both normalize to `comm_rank`.
pub fn normalize(callee: &str) -> Option<String> {
    if let Some(rest) = callee.strip_prefix("MPI_") {
        return Some(rest.to_ascii_lowercase());
    }
    let rest = callee.strip_prefix("mpi_")?;
    let rest = rest.strip_suffix('_')?;
    Some(rest.to_string())
}

/// Is `callee` the rank query, in either naming scheme?
pub fn is_rank_query(callee: &str) -> bool {
    callee.starts_with("mpi_comm_rank_") || callee.starts_with("MPI_Comm_rank")
}

/// The size in bytes of an element of the given datatype handle.
///
/// Handles follow the MPICH numbering. Unknown handles count as one byte.
pub fn datatype_size(datatype: i64) -> u64 {
    match datatype {
        // MPI_CHAR, MPI_SIGNED_CHAR, MPI_UNSIGNED_CHAR, MPI_BYTE
        0x4c000101 | 0x4c000118 | 0x4c000102 | 0x4c00010d => 1,
        // MPI_SHORT, MPI_UNSIGNED_SHORT
        0x4c000203 | 0x4c000204 => 2,
        // MPI_INT, MPI_UNSIGNED, MPI_FLOAT, MPI_INTEGER, MPI_REAL
        0x4c000405 | 0x4c000406 | 0x4c00040a | 0x4c00041b | 0x4c00041c => 4,
        // MPI_LONG, MPI_UNSIGNED_LONG, MPI_DOUBLE, MPI_LONG_LONG,
        // MPI_DOUBLE_PRECISION
        0x4c000807 | 0x4c000808 | 0x4c00080b | 0x4c000809 | 0x4c00080f => 8,
        // MPI_DOUBLE_COMPLEX
        0x4c001023 => 16,
        // Small integers are taken to be the element size itself.
        1 | 2 | 4 | 8 | 16 => datatype as u64,
        _ => 1,
    }
}
