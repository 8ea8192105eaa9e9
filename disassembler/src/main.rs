mod config;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use serde::{Deserialize, Serialize};

use luca_script::{CharsetSpec, Disassembler, Listing, Script, TitleConfig};

use crate::config::{LoggerConfig, ToolConfig};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    label: usize,
    address: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptSummary {
    instructions: usize,
    failures: usize,
    opcodes: BTreeMap<String, usize>,
    labels: Vec<Label>,
}

impl ScriptSummary {
    fn from_listing(listing: &Listing) -> Self {
        Self {
            instructions: listing.lines.len(),
            failures: listing.failures(),
            opcodes: listing.histogram(),
            labels: listing
                .labels
                .iter()
                .map(|(address, label)| Label { label, address })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Summary {
    title: String,
    scripts: BTreeMap<String, ScriptSummary>,
}

/// Disassemble LucaSystem scripts into text listings
#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    #[arg(short, long, required = true)]
    output: PathBuf,

    /// Title config (TOML); defaults to the built-in opcode table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Charset of expressions and script names, overriding the config
    #[arg(short, long)]
    lang: Option<CharsetSpec>,

    /// Render undecodable instructions as raw words instead of stopping
    #[arg(short, long)]
    keep_going: bool,
}

fn load_config(args: &Args) -> Result<(TitleConfig, LoggerConfig)> {
    let (mut title, logger) = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Reading config {:?}", path))?;
            (
                TitleConfig::read(path)?,
                ToolConfig::from_toml_str(&text)?.logger,
            )
        }
        None => (TitleConfig::default(), LoggerConfig::default()),
    };
    if let Some(lang) = &args.lang {
        title.expr_charset = lang.clone();
    }
    Ok((title, logger))
}

fn script_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string())
}

fn run(args: &Args, title: &TitleConfig) -> Result<Summary> {
    let ops = Arc::new(title.operator_set()?);
    let disassembler = Disassembler::new(ops).keep_going(args.keep_going);

    if !args.output.exists() {
        fs::create_dir_all(&args.output)?;
    }

    let mut summary = Summary {
        title: title.name.clone(),
        ..Default::default()
    };
    for input in &args.input {
        let name = script_name(input);
        let bytes = fs::read(input).with_context(|| format!("Reading script {:?}", input))?;
        let script = Script::parse(name.as_str(), bytes)
            .with_context(|| format!("Parsing script {:?}", input))?;
        let listing = disassembler
            .run(&script)
            .with_context(|| format!("Disassembling {:?}", input))?;

        let out = args.output.join(format!("{name}.txt"));
        fs::write(&out, listing.render()).with_context(|| format!("Writing {:?}", out))?;
        log::info!(
            "{}: {} instruction(s), {} label(s) -> {:?}",
            name,
            listing.lines.len(),
            listing.labels.len(),
            out
        );

        summary.scripts.insert(name, ScriptSummary::from_listing(&listing));
    }

    let mut writer = fs::File::create(args.output.join("summary.yaml"))?;
    serde_yaml::to_writer(&mut writer, &summary)?;

    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (title, logger) = load_config(&args)?;
    logger.init();
    run(&args, &title)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use luca_script::ScriptBuilder;
    use pretty_assertions::assert_eq;

    fn workdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("luca-disassembler-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_disassembler() -> Result<()> {
        let dir = workdir("run");
        let mut b = ScriptBuilder::new();
        b.push(4, &[8, 0, 0, 0]); // GOTO
        b.push(0x99, &[1, 0, 7]);
        b.push(8, &[]); // END
        let input = dir.join("start.bin");
        fs::write(&input, b.to_bytes())?;

        let args = Args::parse_from([
            "luca-disassembler",
            "--input",
            input.to_str().unwrap(),
            "--output",
            dir.join("out").to_str().unwrap(),
            "--lang",
            "gbk",
        ]);
        let (title, _) = load_config(&args)?;
        assert_eq!(title.expr_charset, CharsetSpec::Gbk);

        let summary = run(&args, &title)?;
        let listing = fs::read_to_string(dir.join("out/start.txt"))?;
        assert_eq!(listing, "0:goto (label_1)\nlabel_1:\n99 (1, 0x7)\n16:end ()\n");

        let written: Summary =
            serde_yaml::from_str(&fs::read_to_string(dir.join("out/summary.yaml"))?)?;
        let start = &written.scripts["start"];
        assert_eq!(start.instructions, 3);
        assert_eq!(start.labels, vec![Label { label: 1, address: 8 }]);
        assert_eq!(start.opcodes.get("GOTO"), Some(&1));
        assert_eq!(summary.scripts.len(), 1);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn config_file_with_logger_section() -> Result<()> {
        let dir = workdir("config");
        let path = dir.join("title.toml");
        fs::write(
            &path,
            "name = \"demo\"\nopcodes = [\"END\"]\n\n[logger]\napp_level_filter = \"trace\"\n",
        )?;

        let args = Args::parse_from([
            "luca-disassembler",
            "-i",
            "a.bin",
            "-o",
            "out",
            "-c",
            path.to_str().unwrap(),
        ]);
        let (title, logger) = load_config(&args)?;
        assert_eq!(title.name, "demo");
        assert_eq!(title.opcode_table()?.opcode("END"), Some(0));
        assert_eq!(logger.app_level_filter, log::LevelFilter::Trace);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
