//! Build automation tasks for logflow
//!
//! - Generating the CLI reference from the clap definitions

use anyhow::Context;
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for logflow", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<logflow_ingest::Cli>();

    let content = format!(
        r#"# logflow-ingest CLI Reference

Generated from the CLI source code on {}.

## Quick Start

```bash
# Ingest one month of rotated logs, skipping bot traffic
logflow-ingest ingest \
  --log-glob '/var/log/rest/rest.*.log' \
  --start-date 2023-01-01 --end-date 2023-02-01 \
  --namespace rest --out-dir ./data --exclude-bots

# Check how an agent is classified
logflow-ingest classify 'python-requests/2.28.1'

# Inspect the metadata store
logflow-ingest meta --out-dir ./data list
logflow-ingest meta --out-dir ./data export --csv meta.csv
```

## Commands

{}

## Environment Variables

- `LOGFLOW_OUT_DIR`, `LOGFLOW_DB_PATH`, `LOGFLOW_NAMESPACE`, `LOGFLOW_JOBS`
- `LOGFLOW_POLICY` - `include-all` or `exclude-bots`
- `LOGFLOW_CRAWLER_FEED_URL`, `LOGFLOW_CRAWLER_FEED_PATH`, `LOGFLOW_NO_CRAWLER_FEED`
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR` - logging

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
