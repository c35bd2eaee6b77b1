//! The on-disk profile format.
//!
//! A profile file is a concatenation of records. Every record starts with a
//! little-endian `u32` tag and a `u32` element count, followed by the payload.
//! Writers append, so one file can hold several executions (each execution
//! starts with an [`Record::Arguments`] record).

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;

const ARGUMENT_INFO: u32 = 1;
const BLOCK_INFO: u32 = 3;
const EDGE_INFO: u32 = 4;
const RANK_INFO: u32 = 8;
const MPI_INFO: u32 = 9;
const MPI_FULL_INFO: u32 = 10;
const EDGE_RANK_INFO: u32 = 11;
const MPI_TIME_INFO: u32 = 12;
const BLOCK_WEIGHT_INFO: u32 = 13;

/// The counters captured for one trapped communication call site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommCounter {
    /// How many times the call executed.
    pub calls: u64,
    /// The total payload size, in bytes, over all executions.
    pub bytes: u64,
}

/// One typed record of a profile file.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// The command line of the profiled execution.
    Arguments(Vec<String>),
    /// One execution count per basic block.
    Blocks(Vec<u64>),
    /// One execution count per control-flow edge, optionally followed by
    /// captured rank values.
    Edges {
        /// The edge counters.
        counts: Vec<u64>,
        /// Rank values, empty for plain edge profiles.
        ranks: Vec<i32>,
    },
    /// Captured rank values alone.
    Ranks(Vec<i32>),
    /// Old-style communication records: total bytes per trapped call site.
    LegacyComm(Vec<u64>),
    /// Call and byte counters per trapped call site.
    Comm(Vec<CommCounter>),
    /// Measured seconds per timed call site, followed by rank values.
    Time {
        /// Elapsed seconds per site.
        seconds: Vec<f64>,
        /// Rank values.
        ranks: Vec<i32>,
    },
    /// One floating-point weight total per basic block.
    WeightedBlocks(Vec<f64>),
}

impl Record {
    fn tag(&self) -> u32 {
        match self {
            Record::Arguments(_) => ARGUMENT_INFO,
            Record::Blocks(_) => BLOCK_INFO,
            Record::Edges { ranks, .. } if ranks.is_empty() => EDGE_INFO,
            Record::Edges { .. } => EDGE_RANK_INFO,
            Record::Ranks(_) => RANK_INFO,
            Record::LegacyComm(_) => MPI_INFO,
            Record::Comm(_) => MPI_FULL_INFO,
            Record::Time { .. } => MPI_TIME_INFO,
            Record::WeightedBlocks(_) => BLOCK_WEIGHT_INFO,
        }
    }

    /// Encode this record onto the end of `sink`.
    ///
    /// Every element count is a `u32`; larger records cannot be encoded.
    pub fn encode(&self, sink: &mut Vec<u8>) -> Result<()> {
        sink.extend_from_slice(&self.tag().to_le_bytes());
        match self {
            Record::Arguments(args) => {
                // Each argument is NUL-terminated.
                let len: usize = args.iter().map(|a| a.len() + 1).sum();
                put_len(sink, len)?;
                for arg in args {
                    ensure!(!arg.contains('\0'), "argument {arg:?} contains a NUL byte");
                    sink.extend_from_slice(arg.as_bytes());
                    sink.push(0);
                }
            }
            Record::Blocks(counts) | Record::LegacyComm(counts) => put_u64s(sink, counts)?,
            Record::Edges { counts, ranks } => {
                put_u64s(sink, counts)?;
                if !ranks.is_empty() {
                    put_i32s(sink, ranks)?;
                }
            }
            Record::Ranks(ranks) => put_i32s(sink, ranks)?,
            Record::Comm(counters) => {
                put_len(sink, counters.len())?;
                for c in counters {
                    sink.extend_from_slice(&c.calls.to_le_bytes());
                    sink.extend_from_slice(&c.bytes.to_le_bytes());
                }
            }
            Record::Time { seconds, ranks } => {
                put_f64s(sink, seconds)?;
                put_i32s(sink, ranks)?;
            }
            Record::WeightedBlocks(weights) => put_f64s(sink, weights)?,
        }
        Ok(())
    }
}

fn put_len(sink: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| anyhow::anyhow!("record of {len} elements is too large to encode"))?;
    sink.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_u64s(sink: &mut Vec<u8>, values: &[u64]) -> Result<()> {
    put_len(sink, values.len())?;
    for v in values {
        sink.extend_from_slice(&v.to_le_bytes());
    }
    Ok(())
}

fn put_f64s(sink: &mut Vec<u8>, values: &[f64]) -> Result<()> {
    put_len(sink, values.len())?;
    for v in values {
        sink.extend_from_slice(&v.to_le_bytes());
    }
    Ok(())
}

fn put_i32s(sink: &mut Vec<u8>, values: &[i32]) -> Result<()> {
    put_len(sink, values.len())?;
    for v in values {
        sink.extend_from_slice(&v.to_le_bytes());
    }
    Ok(())
}

/// Encode a sequence of records into a byte buffer.
pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Result<Vec<u8>> {
    let mut bytes = vec![];
    for record in records {
        record.encode(&mut bytes)?;
    }
    Ok(bytes)
}

/// Append records to the profile file at `path`, creating it if necessary.
pub fn append_records<'a>(
    path: impl AsRef<Path>,
    records: impl IntoIterator<Item = &'a Record>,
) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode_records(records)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open profile `{}` for writing", path.display()))?;
    file.write_all(&bytes)
        .with_context(|| format!("failed to write profile `{}`", path.display()))?;
    Ok(())
}

/// Decode every record in `bytes`.
///
/// Truncated records and unknown tags are errors; nothing is returned for a
/// partially decoded buffer.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut reader = bytes;
    let mut records = vec![];
    while !reader.is_empty() {
        let offset = bytes.len() - reader.len();
        let record = read_record(&mut reader)
            .with_context(|| format!("malformed profile record at offset {offset}"))?;
        records.push(record);
    }
    Ok(records)
}

/// Read and decode every record in the profile file at `path`.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read profile `{}`", path.display()))?;
    decode_records(&bytes).with_context(|| format!("failed to decode profile `{}`", path.display()))
}

fn read_record(reader: &mut &[u8]) -> Result<Record> {
    let tag = read_u32(reader)?;
    Ok(match tag {
        ARGUMENT_INFO => {
            let len = read_len(reader)?;
            ensure!(
                len <= reader.len(),
                "profile is truncated: arguments need {len} bytes but only {} remain",
                reader.len()
            );
            let mut buf = vec![0; len];
            read_exact(reader, &mut buf)?;
            let args = String::from_utf8(buf).context("arguments are not valid UTF-8")?;
            Record::Arguments(if args.contains('\0') {
                args.split_terminator('\0').map(Into::into).collect()
            } else {
                // Older writers joined the command line with spaces.
                args.split(' ').filter(|a| !a.is_empty()).map(Into::into).collect()
            })
        }
        BLOCK_INFO => Record::Blocks(read_u64s(reader)?),
        EDGE_INFO => Record::Edges {
            counts: read_u64s(reader)?,
            ranks: vec![],
        },
        EDGE_RANK_INFO => Record::Edges {
            counts: read_u64s(reader)?,
            ranks: read_i32s(reader)?,
        },
        RANK_INFO => Record::Ranks(read_i32s(reader)?),
        MPI_INFO => Record::LegacyComm(read_u64s(reader)?),
        MPI_FULL_INFO => {
            let len = read_len(reader)?;
            let mut counters = Vec::with_capacity(len.min(reader.len() / 16));
            for _ in 0..len {
                let calls = read_u64(reader)?;
                let bytes = read_u64(reader)?;
                counters.push(CommCounter { calls, bytes });
            }
            Record::Comm(counters)
        }
        MPI_TIME_INFO => Record::Time {
            seconds: read_f64s(reader)?,
            ranks: read_i32s(reader)?,
        },
        BLOCK_WEIGHT_INFO => Record::WeightedBlocks(read_f64s(reader)?),
        _ => bail!("unknown profile record type {tag}"),
    })
}

fn read_exact(reader: &mut &[u8], buf: &mut [u8]) -> Result<()> {
    ensure!(
        reader.len() >= buf.len(),
        "profile is truncated: needed {} more bytes but only {} remain",
        buf.len(),
        reader.len()
    );
    reader.read_exact(buf)?;
    Ok(())
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    let mut buf = [0; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut &[u8]) -> Result<u64> {
    let mut buf = [0; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_len(reader: &mut &[u8]) -> Result<usize> {
    Ok(read_u32(reader)? as usize)
}

fn read_u64s(reader: &mut &[u8]) -> Result<Vec<u64>> {
    let len = read_len(reader)?;
    let mut values = Vec::with_capacity(len.min(reader.len() / 8));
    for _ in 0..len {
        values.push(read_u64(reader)?);
    }
    Ok(values)
}

fn read_f64s(reader: &mut &[u8]) -> Result<Vec<f64>> {
    Ok(read_u64s(reader)?.into_iter().map(f64::from_bits).collect())
}

fn read_i32s(reader: &mut &[u8]) -> Result<Vec<i32>> {
    let len = read_len(reader)?;
    let mut values = Vec::with_capacity(len.min(reader.len() / 4));
    for _ in 0..len {
        values.push(read_u32(reader)? as i32);
    }
    Ok(values)
}
