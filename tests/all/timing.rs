use anyhow::Result;
use commprof::timing::TimingKind;
use commprof::Analyzer;
use std::path::PathBuf;

#[test]
fn not_enough_files() {
    // None of these files exist; the count check must fail before any of
    // them is opened.
    let files = [PathBuf::from("/nonexistent/a.json"), PathBuf::from("/nonexistent/b.json")];
    let err = Analyzer::new(
        &[TimingKind::Block, TimingKind::Mpi, TimingKind::LibCall],
        &files,
        None,
    )
    .unwrap_err();
    assert!(err.to_string().contains("not enough files"), "{err:#}");
}

#[test]
fn sources_and_ignore_list_from_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let block = dir.path().join("block.json");
    std::fs::write(&block, r#"{ "instruction_costs": { "add": 1.5 } }"#)?;
    let mpi = dir.path().join("mpi.json");
    std::fs::write(
        &mpi,
        r#"{ "latency_ns": 100.0, "bandwidth": 1.0, "processes": 2,
             "fitting": { "send": { "intercept": 1e-6 } } }"#,
    )?;
    let ignore = dir.path().join("ignore.txt");
    std::fs::write(&ignore, "init_grid\n  dump_state\tcheckpoint\n")?;

    let analyzer = Analyzer::new(
        &[TimingKind::Block, TimingKind::Mpi],
        &[block, mpi],
        Some(ignore.as_path()),
    )?;
    let debug = format!("{analyzer:?}");
    for name in ["init_grid", "dump_state", "checkpoint"] {
        assert!(debug.contains(name), "{debug}");
    }
    Ok(())
}

#[test]
fn missing_ignore_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let err = Analyzer::new::<PathBuf>(&[], &[], Some(dir.path().join("ignore.txt").as_path()))
        .unwrap_err();
    assert!(format!("{err:#}").contains("ignore file"), "{err:#}");
    Ok(())
}

#[test]
fn malformed_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mpi = dir.path().join("mpi.json");
    std::fs::write(&mpi, r#"{ "latency_ns": 100.0 }"#)?;
    let err = Analyzer::new(&[TimingKind::Mpi], &[&mpi], None).unwrap_err();
    assert!(format!("{err:#}").contains("invalid mpi timing source"), "{err:#}");
    Ok(())
}
