/// メモリダンプ探索CLI - MCPクライアントなしでライブラリを叩くデバッグ用
///
/// Usage:
///   dumpscan list --dir ./dumps
///   dumpscan info memory.raw
///   dumpscan run memory.raw windows.pslist.PsList --pid 4
///   dumpscan plugins

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use volatility_mcp::dump_scanner;
use volatility_mcp::tools::VolatilityTools;
use volatility_mcp::volatility_runner::{parse_plugin_list, VolatilityRunner};

#[derive(Parser)]
#[command(name = "dumpscan")]
#[command(about = "Memory dump discovery and Volatility plugin runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List memory dump files in a directory
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show image information for a memory dump
    Info {
        /// Path to the memory dump file
        dump: PathBuf,
    },

    /// Run an arbitrary Volatility plugin against a memory dump
    Run {
        /// Path to the memory dump file
        dump: PathBuf,

        /// Plugin name (e.g. windows.pslist.PsList)
        plugin: String,

        /// Additional plugin arguments
        args: Vec<String>,
    },

    /// List available Volatility plugins
    Plugins,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    println!("🔍 Volatility Dump Scanner");
    println!("{}", "=".repeat(80));

    match cli.command {
        Some(Commands::List { dir }) => {
            cmd_list(dir.as_deref())?;
        }
        Some(Commands::Info { dump }) => {
            let tools = make_tools()?;
            cmd_info(&tools, &dump).await?;
        }
        Some(Commands::Run { dump, plugin, args }) => {
            let tools = make_tools()?;
            cmd_run(&tools, &dump, &plugin, &args).await?;
        }
        Some(Commands::Plugins) => {
            let tools = make_tools()?;
            cmd_plugins(&tools).await?;
        }
        None => {
            // デフォルト: カレントディレクトリのダンプ一覧
            cmd_list(None)?;
        }
    }

    println!("\n{}", "=".repeat(80));
    println!("✅ Done!");

    Ok(())
}

/// VOLATILITY_PATHからツール層を初期化
fn make_tools() -> Result<VolatilityTools> {
    let volatility_dir = std::env::var("VOLATILITY_PATH").map_err(|_| {
        anyhow::anyhow!("VOLATILITY_PATH not set. Point it at your Volatility 3 installation")
    })?;

    let runner = VolatilityRunner::new(&volatility_dir)?;
    Ok(VolatilityTools::new(Arc::new(runner)))
}

fn cmd_list(dir: Option<&Path>) -> Result<()> {
    let search_dir = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir()?,
    };

    println!("\n📂 Scanning for memory dumps in: {}", search_dir.display());

    let files = dump_scanner::scan(&search_dir)?;

    if files.is_empty() {
        println!("   ❌ No memory dump files found");
        return Ok(());
    }

    println!("   ✅ Found {} dump candidates", files.len());

    let total_mb: f64 = files.iter().map(|f| f.size_mb).sum();
    println!("   Total size: {:.2} MB", total_mb);

    for (i, file) in files.iter().take(50).enumerate() {
        println!("   [{:3}] {} ({:.2} MB)", i, file.path, file.size_mb);
    }

    if files.len() > 50 {
        println!("   ... and {} more files", files.len() - 50);
    }

    Ok(())
}

async fn cmd_info(tools: &VolatilityTools, dump: &Path) -> Result<()> {
    println!("\n📊 Image info: {}", dump.display());

    match tools.run_builtin("get_image_info", &dump.to_string_lossy()).await {
        Ok(output) => println!("{}", output),
        Err(e) => println!("   ❌ {}", e),
    }

    Ok(())
}

async fn cmd_run(
    tools: &VolatilityTools,
    dump: &Path,
    plugin: &str,
    args: &[String],
) -> Result<()> {
    println!("\n🔬 Running plugin: {}", plugin);

    let additional_args = args.join(" ");
    match tools
        .run_custom_plugin(&dump.to_string_lossy(), plugin, &additional_args)
        .await
    {
        Ok(output) => println!("{}", output),
        Err(e) => println!("   ❌ {}", e),
    }

    Ok(())
}

async fn cmd_plugins(tools: &VolatilityTools) -> Result<()> {
    println!("\n🧩 Available plugins:");

    match tools.list_available_plugins().await {
        Ok(output) => {
            let plugins = parse_plugin_list(&output);
            if plugins.is_empty() {
                // 見出しが見つからない場合はヘルプ全文を表示
                println!("{}", output);
            } else {
                println!("   Total: {}", plugins.len());
                for plugin in &plugins {
                    println!("   - {}", plugin);
                }
            }
        }
        Err(e) => println!("   ❌ {}", e),
    }

    Ok(())
}
