use std::fs;
use std::path::Path;

use anyhow::Result;
use tempfile::tempdir;

use shotgun_pipelines::config::defs::PipelineError;
use shotgun_pipelines::pipelines::merge::{
    merge, merge_levels, MergeError, MergeLevel, MergeOptions, StageOutputTable, SuffixPattern,
};


fn table(source: &str, text: &str) -> Result<StageOutputTable> {
    Ok(StageOutputTable::parse(Path::new(source), text)?)
}

fn no_suffix() -> Result<SuffixPattern> {
    Ok(SuffixPattern::new("")?)
}

#[test]
fn test_union_law() -> Result<()> {
    let a = table("A.tsv", "# Feature\tA\nk1\t1\nk2\t2\n")?;
    let b = table("B.tsv", "# Feature\tB\nk2\t3\nk3\t4\n")?;
    let merged = merge(&[a, b], &no_suffix()?, &MergeOptions::default())?;

    let mut keys: Vec<&str> = merged.rows.iter().map(|(k, _)| k.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["k1", "k2", "k3"]);
    let column = |name: &str| -> Vec<Option<f64>> {
        ["k1", "k2", "k3"].iter().map(|k| merged.value(k, name)).collect()
    };
    assert_eq!(column("a"), vec![Some(1.0), Some(2.0), Some(0.0)]);
    assert_eq!(column("b"), vec![Some(0.0), Some(3.0), Some(4.0)]);
    Ok(())
}

#[test]
fn test_disjoint_row_count() -> Result<()> {
    let left: String = (0..7).map(|i| format!("left{}\t{}\n", i, i + 1)).collect();
    let right: String = (0..5).map(|i| format!("right{}\t{}\n", i, i + 1)).collect();
    let a = table("L.tsv", &format!("#gene\tL\n{}", left))?;
    let b = table("R.tsv", &format!("#gene\tR\n{}", right))?;
    let merged = merge(&[a, b], &no_suffix()?, &MergeOptions::default())?;
    assert_eq!(merged.rows.len(), 7 + 5);
    Ok(())
}

#[test]
fn test_stratified_rows_stay_separate() -> Result<()> {
    let a = table("A.tsv", "# Pathway\tA_Abundance\npathwayX\t10\npathwayX|g__Genus\t4\n")?;
    let b = table("B.tsv", "# Pathway\tB_Abundance\npathwayX|g__Genus\t6\n")?;
    let merged = merge(&[a, b], &SuffixPattern::new("_Abundance")?, &MergeOptions::default())?;

    assert_eq!(merged.rows.len(), 2);
    assert_eq!(merged.stratified_rows(), 1);
    assert_eq!(merged.value("pathwayX", "a"), Some(10.0));
    assert_eq!(merged.value("pathwayX", "b"), Some(0.0));
    assert_eq!(merged.value("pathwayX|g__Genus", "a"), Some(4.0));
    assert_eq!(merged.value("pathwayX|g__Genus", "b"), Some(6.0));
    Ok(())
}

#[test]
fn test_order_independent() -> Result<()> {
    let a = table("a/S2.tsv", "#taxon\tS2_otus\nx\t1\ny\t5\n")?;
    let b = table("b/S1.tsv", "#taxon\tS1_otus\ny\t2\nz\t5\n")?;
    let pattern = SuffixPattern::new("_otus")?;
    let one = merge(&[a.clone(), b.clone()], &pattern, &MergeOptions::default())?;
    let two = merge(&[b, a], &pattern, &MergeOptions::default())?;
    assert_eq!(one, two);
    assert_eq!(one.columns, vec!["s1", "s2"]);
    assert_eq!(one.to_tsv(), "taxon\ts1\ts2\ny\t2\t5\nz\t5\t0\nx\t0\t1\n");
    Ok(())
}

#[test]
fn test_canonical_collision_names_both_files() -> Result<()> {
    let a = table("run1/S1_genefamilies.tsv", "# Gene Family\tS1_Abundance-RPKs\nk\t1\n")?;
    let b = table("run2/S1_genefamilies.tsv", "# Gene Family\tS1_abundance\nk\t2\n")?;
    let pattern = SuffixPattern::new("_Abundance(-RPKs)?")?;
    let err = merge(&[a, b], &pattern, &MergeOptions::default()).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, MergeError::DuplicateSample { .. }));
    assert!(message.contains("run1/S1_genefamilies.tsv"));
    assert!(message.contains("run2/S1_genefamilies.tsv"));

    let wrapped: PipelineError = err.into();
    assert!(!wrapped.is_configuration());
    Ok(())
}

#[tokio::test]
async fn test_levels_fail_independently() -> Result<()> {
    let tables = tempdir()?;
    let out = tempdir()?;
    fs::write(tables.path().join("S1.genus.tsv"), "# taxon\tS1_otus\ng__A\t3\n")?;
    fs::write(tables.path().join("S2.genus.tsv"), "# taxon\tS2_otus\ng__A\t1\ng__B\t9\n")?;
    fs::write(tables.path().join("S1.species.tsv"), "# taxon\tS1_otus\ns__A\t3\n")?;
    fs::write(tables.path().join("S2.species.tsv"), "taxon\tS2_otus\ns__B\t3\n")?;

    let levels = vec![
        MergeLevel::parse("genus=.genus.tsv").map_err(anyhow::Error::msg)?,
        MergeLevel::parse("species=.species.tsv").map_err(anyhow::Error::msg)?,
        MergeLevel::parse("phylum=.phylum.tsv").map_err(anyhow::Error::msg)?,
    ];
    let results = merge_levels(
        &levels,
        tables.path(),
        out.path(),
        &SuffixPattern::new("_otus")?,
        &MergeOptions::default(),
    )
    .await;

    assert!(results[0].1.is_ok());
    assert_eq!(
        fs::read_to_string(out.path().join("merged_genus.tsv"))?,
        "taxon\ts1\ts2\ng__B\t0\t9\ng__A\t3\t1\n"
    );
    assert!(matches!(results[1].1, Err(MergeError::MissingKeyMarker { .. })));
    assert!(!out.path().join("merged_species.tsv").exists());
    assert!(matches!(results[2].1, Err(MergeError::NoTables(_))));
    Ok(())
}
