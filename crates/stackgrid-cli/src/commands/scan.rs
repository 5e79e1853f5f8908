use std::path::Path;

use stackgrid_core::StackConfig;
use stackgrid_scanner::ScanSettings;

use crate::OutputFormat;

pub fn scan(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let config = StackConfig::load_or_default(path)?;
    let (_, candidates) = stackgrid_scanner::scan_dir(path, ScanSettings::from(&config.scan))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        OutputFormat::Text => {
            println!("{}", stackgrid_scanner::report::format_candidates(path, &candidates));
        }
    }

    Ok(())
}
