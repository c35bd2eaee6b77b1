use crate::{assert_no_diff, module};
use anyhow::Result;
use commprof::storage::{self, CommCounter, Record};
use commprof::{Profile, ProfileInfo, TrapFormat};

fn assert_profile(profile: &Profile, expected: &str) -> Result<()> {
    let expected = expected.trim();
    let actual = serde_json::to_string_pretty(profile)?;
    assert_no_diff(expected, actual.trim());
    Ok(())
}

const ONE_SEND: &str = r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        {
          "insts": [
            {
              "call": {
                "callee": { "direct": "mpi_send_" },
                "args": [ { "var": "buf" }, { "const": 50 }, { "const": 8 }, { "const": 1 } ]
              }
            }
          ],
          "terminator": "ret"
        }
      ]
    }
  ]
}
"#;

#[test]
fn basic() -> Result<()> {
    let profile = Profile::from_records([
        Record::Arguments(vec!["prog".into(), "-n".into(), "4".into()]),
        Record::Edges {
            counts: vec![1, 2],
            ranks: vec![3],
        },
    ])?;
    assert_profile(
        &profile,
        r#"
{
  "executions": [
    [
      "prog",
      "-n",
      "4"
    ]
  ],
  "edge_counts": [
    1,
    2
  ],
  "block_counts": null,
  "comm": null,
  "legacy_comm": null,
  "comm_seconds": null,
  "block_weights": null,
  "ranks": [
    3
  ],
  "unknown_rank": false
}
        "#,
    )
}

#[test]
fn appended_executions_are_summed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("commprof.out");
    for rank in [0, -1] {
        storage::append_records(
            &path,
            &[
                Record::Arguments(vec!["a.out".into()]),
                Record::Edges {
                    counts: vec![1, 4, 0],
                    ranks: vec![rank],
                },
                Record::Comm(vec![CommCounter { calls: 4, bytes: 64 }]),
            ],
        )?;
    }

    let profile = Profile::from_file(&path)?;
    assert_eq!(profile.num_executions(), 2);
    assert_eq!(profile.edge_counts(), Some(&[2, 8, 0][..]));
    assert_eq!(profile.comm(), Some(&[CommCounter { calls: 8, bytes: 128 }][..]));
    assert_eq!(profile.ranks().iter().copied().collect::<Vec<_>>(), [0]);
    assert!(profile.has_unknown_rank());
    Ok(())
}

#[test]
fn truncated_file_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("truncated.out");
    let mut bytes = storage::encode_records(&[Record::Blocks(vec![1, 2, 3])])?;
    bytes.pop();
    std::fs::write(&path, &bytes)?;

    let err = Profile::from_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("truncated.out"), "{err:#}");
    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    assert!(Profile::from_file("/nonexistent/commprof.out").is_err());
}

#[test]
fn unknown_record_type_is_an_error() {
    let mut bytes = vec![];
    bytes.extend_from_slice(&2_u32.to_le_bytes());
    bytes.extend_from_slice(&0_u32.to_le_bytes());
    let err = Profile::from_bytes(&bytes).unwrap_err();
    assert!(format!("{err:#}").contains("unknown profile record type 2"), "{err:#}");
}

#[test]
fn merging_mismatched_profiles_fails() -> Result<()> {
    let mut a = Profile::from_records([Record::Blocks(vec![1, 2])])?;
    let b = Profile::from_records([Record::Blocks(vec![1, 2, 3])])?;
    let before = a.clone();
    assert!(a.merge(&b).is_err());
    assert_eq!(a, before);
    Ok(())
}

#[test]
fn compare_profiles() -> Result<()> {
    let a = Profile::from_records([
        Record::Arguments(vec![]),
        Record::Blocks(vec![1, 2]),
    ])?;
    let b = Profile::from_records([
        Record::Arguments(vec![]),
        Record::Blocks(vec![1, 3]),
    ])?;
    let c = Profile::from_records([Record::Blocks(vec![1, 2])])?;
    assert!(commprof::compare(&a, &a));
    assert!(commprof::compare(&a, &b));
    assert!(!commprof::compare(&a, &c));
    Ok(())
}

#[test]
fn legacy_records_count_calls_by_block() -> Result<()> {
    let program = module(ONE_SEND);
    let profile = Profile::from_records([
        Record::Edges {
            counts: vec![5],
            ranks: vec![],
        },
        Record::LegacyComm(vec![2000]),
    ])?;
    let info = ProfileInfo::new(&program, &profile)?;
    let call = &info.trapped_calls()[0];
    assert_eq!(call.format, TrapFormat::Legacy);
    assert_eq!(call.calls, 5);
    assert_eq!(call.bytes, 2000);
    assert_eq!(info.trapped_calls_in(TrapFormat::Full).count(), 0);
    Ok(())
}

#[test]
fn full_records_win_over_legacy_ones() -> Result<()> {
    let program = module(ONE_SEND);
    let profile = Profile::from_records([
        Record::LegacyComm(vec![2000]),
        Record::Comm(vec![CommCounter {
            calls: 2,
            bytes: 800,
        }]),
    ])?;
    let info = ProfileInfo::new(&program, &profile)?;
    let call = &info.trapped_calls()[0];
    assert_eq!(call.format, TrapFormat::Full);
    assert_eq!((call.calls, call.bytes), (2, 800));
    // No block counts: the call count stands in for the block frequency.
    assert!(!info.has_block_counts());
    assert_eq!(info.block_frequency(call), 2);
    Ok(())
}

#[test]
fn counters_must_fit_the_module() -> Result<()> {
    let program = module(ONE_SEND);
    let edges = Profile::from_records([Record::Edges {
        counts: vec![1, 2, 3],
        ranks: vec![],
    }])?;
    assert!(ProfileInfo::new(&program, &edges).is_err());

    let comm = Profile::from_records([Record::Comm(vec![])])?;
    assert!(ProfileInfo::new(&program, &comm).is_err());
    Ok(())
}

#[test]
fn block_weights_are_summed_and_bound() -> Result<()> {
    let program = module(ONE_SEND);
    let mut profile = Profile::from_records([Record::WeightedBlocks(vec![1.5])])?;
    profile.merge(&Profile::from_records([Record::WeightedBlocks(vec![2.0])])?)?;
    assert_eq!(profile.block_weights(), Some(&[3.5][..]));
    let info = ProfileInfo::new(&program, &profile)?;
    assert_eq!(info.block_weight(0, commprof::ir::BlockId(0)), Some(3.5));

    let mismatched = Profile::from_records([Record::WeightedBlocks(vec![1.0, 2.0])])?;
    assert!(ProfileInfo::new(&program, &mismatched).is_err());
    Ok(())
}
