use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, error};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

mod dump_scanner;
mod tools;
mod volatility_runner;

use tools::{builtin_plugins, VolatilityTools};
use volatility_runner::{parse_plugin_list, VolatilityRunner};

#[derive(Debug, Deserialize)]
struct McpRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct McpResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<McpError>,
}

#[derive(Debug, Serialize)]
struct McpError {
    code: i32,
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("🦀 Volatility-MCP Native Server starting...");

    // Volatility 3のインストール先は環境変数で指定
    let volatility_dir = std::env::var("VOLATILITY_PATH").map_err(|_| {
        anyhow::anyhow!("VOLATILITY_PATH not set. Point it at your Volatility 3 installation")
    })?;

    let runner = match VolatilityRunner::new(&volatility_dir) {
        Ok(runner) => {
            info!("✅ Volatility 3 enabled at: {}", volatility_dir);
            // ディスクキャッシュをロード
            if let Err(e) = runner.load_cache_from_disk() {
                error!("Failed to load plugin help cache: {}", e);
            }
            Arc::new(runner)
        }
        Err(e) => {
            error!("Failed to initialize Volatility runner: {}", e);
            return Err(e);
        }
    };

    let tools = Arc::new(VolatilityTools::new(Arc::clone(&runner)));

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    info!("✅ Server ready, waiting for MCP requests...");

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let response =
                    match process_request(&line, Arc::clone(&tools), Arc::clone(&runner)).await {
                        Ok(resp) => resp,
                        Err(e) => {
                            error!("Request processing error: {}", e);
                            McpResponse {
                                jsonrpc: "2.0".to_string(),
                                id: None,
                                result: None,
                                error: Some(McpError {
                                    code: -32603,
                                    message: e.to_string(),
                                }),
                            }
                        }
                    };

                let response_str = serde_json::to_string(&response)?;
                stdout.write_all(response_str.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    info!("Server shutting down");
    Ok(())
}

async fn process_request(
    request_str: &str,
    tools: Arc<VolatilityTools>,
    runner: Arc<VolatilityRunner>,
) -> Result<McpResponse> {
    let request: McpRequest = serde_json::from_str(request_str)?;

    info!("Processing method: {}", request.method);

    let result = match request.method.as_str() {
        "initialize" => handle_initialize().await?,
        "tools/list" => handle_list_tools().await?,
        "tools/call" => handle_tool_call(request.params, tools).await?,
        "resources/list" => handle_list_resources().await?,
        "resources/read" => match handle_read_resource(request.params, runner).await {
            Ok(result) => result,
            Err(e) => {
                return Ok(McpResponse {
                    jsonrpc: "2.0".to_string(),
                    id: request.id,
                    result: None,
                    error: Some(McpError {
                        code: -32602,
                        message: e.to_string(),
                    }),
                });
            }
        },
        _ => {
            return Ok(McpResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(McpError {
                    code: -32601,
                    message: format!("Method not found: {}", request.method),
                }),
            });
        }
    };

    Ok(McpResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id,
        result: Some(result),
        error: None,
    })
}

async fn handle_initialize() -> Result<Value> {
    Ok(json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {},
            "resources": {}
        },
        "serverInfo": {
            "name": "volatility-mcp-native",
            "version": "0.1.0",
            "description": "Memory forensics via Volatility 3 plugins"
        }
    }))
}

async fn handle_list_tools() -> Result<Value> {
    // ダンプパスのみ受け取るツールの共通スキーマ
    let dump_only_schema = json!({
        "type": "object",
        "properties": {
            "memory_dump_path": {
                "type": "string",
                "description": "メモリダンプファイルのフルパス"
            }
        },
        "required": ["memory_dump_path"]
    });

    Ok(json!({
        "tools": [
            {
                "name": "list_available_plugins",
                "description": "利用可能なVolatilityプラグイン一覧を取得",
                "inputSchema": {
                    "type": "object",
                    "properties": {}
                }
            },
            {
                "name": "get_image_info",
                "description": "メモリダンプの基本情報を取得（OS、カーネルバージョン等）。最初にこれを呼んでイメージの素性を確認する",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_pstree",
                "description": "PsTreeプラグインでプロセスツリーを表示",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_pslist",
                "description": "PsListプラグインでプロセス一覧を表示",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_psscan",
                "description": "PsScanプラグインで隠蔽された可能性のあるプロセスをスキャン",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_netscan",
                "description": "NetScanプラグインでネットワーク接続を表示",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_malfind",
                "description": "MalFindプラグインでコード/DLLインジェクションを検出",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "memory_dump_path": {
                            "type": "string",
                            "description": "メモリダンプファイルのフルパス"
                        },
                        "dump_dir": {
                            "type": "string",
                            "description": "不審なメモリセクションの書き出し先ディレクトリ（任意）"
                        }
                    },
                    "required": ["memory_dump_path"]
                }
            },
            {
                "name": "run_cmdline",
                "description": "CmdLineプラグインでプロセスのコマンドライン引数を表示",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_dlllist",
                "description": "DllListプラグインでロード済みDLLを一覧化",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "memory_dump_path": {
                            "type": "string",
                            "description": "メモリダンプファイルのフルパス"
                        },
                        "pid": {
                            "type": "integer",
                            "description": "結果を絞り込むプロセスID（任意）"
                        }
                    },
                    "required": ["memory_dump_path"]
                }
            },
            {
                "name": "run_handles",
                "description": "Handlesプラグインでプロセスのオープンハンドルを一覧化",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "memory_dump_path": {
                            "type": "string",
                            "description": "メモリダンプファイルのフルパス"
                        },
                        "pid": {
                            "type": "integer",
                            "description": "結果を絞り込むプロセスID（任意）"
                        }
                    },
                    "required": ["memory_dump_path"]
                }
            },
            {
                "name": "run_filescan",
                "description": "FileScanプラグインでファイルオブジェクトをスキャン",
                "inputSchema": dump_only_schema.clone()
            },
            {
                "name": "run_memmap",
                "description": "MemMapプラグインで特定プロセスのメモリマップを表示",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "memory_dump_path": {
                            "type": "string",
                            "description": "メモリダンプファイルのフルパス"
                        },
                        "pid": {
                            "type": "integer",
                            "description": "解析対象のプロセスID"
                        }
                    },
                    "required": ["memory_dump_path", "pid"]
                }
            },
            {
                "name": "run_custom_plugin",
                "description": "任意のVolatilityプラグインを実行（組み込みツールにないプラグイン用）",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "memory_dump_path": {
                            "type": "string",
                            "description": "メモリダンプファイルのフルパス"
                        },
                        "plugin_name": {
                            "type": "string",
                            "description": "プラグイン名（例: linux.pslist.PsList）"
                        },
                        "additional_args": {
                            "type": "string",
                            "description": "空白区切りの追加引数（任意）"
                        }
                    },
                    "required": ["memory_dump_path", "plugin_name"]
                }
            },
            {
                "name": "list_memory_dumps",
                "description": "ディレクトリ内のメモリダンプ候補ファイルを一覧化（再帰探索）",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "search_dir": {
                            "type": "string",
                            "description": "探索するディレクトリ（省略時はカレントディレクトリ）"
                        }
                    }
                }
            }
        ]
    }))
}

async fn handle_tool_call(params: Option<Value>, tools: Arc<VolatilityTools>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow::anyhow!("Missing params"))?;
    let tool_name = params["name"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing tool name"))?;
    let arguments = &params["arguments"];

    info!("Calling tool: {}", tool_name);

    let result = match tool_name {
        "list_available_plugins" => tools.list_available_plugins().await,

        "run_dlllist" => {
            let dump = require_str(arguments, "memory_dump_path")?;
            let pid = arguments["pid"].as_u64().map(|p| p as u32);
            tools.run_dlllist(dump, pid).await
        }

        "run_handles" => {
            let dump = require_str(arguments, "memory_dump_path")?;
            let pid = arguments["pid"].as_u64().map(|p| p as u32);
            tools.run_handles(dump, pid).await
        }

        "run_memmap" => {
            let dump = require_str(arguments, "memory_dump_path")?;
            let pid = arguments["pid"]
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("Missing pid"))? as u32;
            tools.run_memmap(dump, pid).await
        }

        "run_malfind" => {
            let dump = require_str(arguments, "memory_dump_path")?;
            let dump_dir = arguments["dump_dir"].as_str();
            tools.run_malfind(dump, dump_dir).await
        }

        "run_custom_plugin" => {
            let dump = require_str(arguments, "memory_dump_path")?;
            let plugin = require_str(arguments, "plugin_name")?;
            let additional_args = arguments["additional_args"].as_str().unwrap_or("");
            tools.run_custom_plugin(dump, plugin, additional_args).await
        }

        "list_memory_dumps" => {
            let search_dir = arguments["search_dir"].as_str();
            tools.list_memory_dumps(search_dir)
        }

        // ダンプパスのみ受け取る組み込みツールは対応表で処理
        name if builtin_plugins().contains_key(name) => {
            let dump = require_str(arguments, "memory_dump_path")?;
            tools.run_builtin(name, dump).await
        }

        _ => {
            return Err(anyhow::anyhow!("Unknown tool: {}", tool_name));
        }
    };

    // ドメインエラー（ダンプ不在、プラグイン失敗等）はツール結果のテキストとして返す
    let text = match result {
        Ok(output) => output,
        Err(e) => e.to_string(),
    };

    Ok(json!({
        "content": [{
            "type": "text",
            "text": text
        }]
    }))
}

async fn handle_list_resources() -> Result<Value> {
    Ok(json!({
        "resources": [
            {
                "uri": "volatility://plugins",
                "name": "Volatility plugin list",
                "description": "利用可能なプラグイン名の一覧（JSON）",
                "mimeType": "application/json"
            }
        ]
    }))
}

async fn handle_read_resource(params: Option<Value>, runner: Arc<VolatilityRunner>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow::anyhow!("Missing params"))?;
    let uri = params["uri"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing uri"))?;

    info!("Reading resource: {}", uri);

    if uri == "volatility://plugins" {
        let help = runner.run(&["-h".to_string()]).await?;
        let plugins = parse_plugin_list(&help);
        let text = serde_json::to_string_pretty(&plugins)?;

        return Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text
            }]
        }));
    }

    if let Some(plugin) = uri.strip_prefix("volatility://help/") {
        let text = runner.plugin_help(plugin).await?;

        return Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "text/plain",
                "text": text
            }]
        }));
    }

    Err(anyhow::anyhow!("Unknown resource URI: {}", uri))
}

fn require_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str> {
    arguments[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing {}", key))
}
