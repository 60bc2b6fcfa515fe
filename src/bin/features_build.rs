use std::path::{Path, PathBuf};

use txfeat::{
    build_features, init_logging, load_transactions, log_app_start, logging_config_from_env,
    write_features,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = logging_config_from_env();
    init_logging(&config)?;
    log_app_start(&config);

    let input = std::env::var("TXFEAT_INPUT_PATH")
        .map(PathBuf::from)
        .map_err(|_| "TXFEAT_INPUT_PATH must point to a parquet or csv transactions file")?;
    let output = std::env::var("TXFEAT_OUTPUT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_output_path(&input));

    let transactions = load_transactions(&input, None)?;
    let mut augmented = build_features(&transactions)?;
    write_features(&output, &mut augmented)?;

    println!(
        "Features written | input={} output={} rows={} columns={}",
        input.display(),
        output.display(),
        augmented.height(),
        augmented.width()
    );

    Ok(())
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("transactions");
    let extension = input
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or("parquet");
    input.with_file_name(format!("{stem}_features.{extension}"))
}
