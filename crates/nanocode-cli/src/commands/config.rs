use anyhow::Result;
use nanocode_core::AppConfig;

use crate::output::{print_json, redact_config_for_display};

pub(crate) fn run_config(cfg: &AppConfig, json: bool) -> Result<()> {
    let shown = redact_config_for_display(cfg)?;
    if json {
        print_json(&shown)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    }
    Ok(())
}
