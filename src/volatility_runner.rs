use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use xxhash_rust::xxh3::xxh3_64;

/// Volatility 3 連携モジュール
///
/// 外部のVolatility 3フレームワークをサブプロセスで呼び出す
/// プラグインヘルプはキャッシュ機構により2回目以降は即座に結果を返す
#[derive(Debug)]
pub struct VolatilityRunner {
    python: String,
    volatility_dir: PathBuf,
    script_path: PathBuf,
    cache_dir: PathBuf,
    help_cache: Mutex<HashMap<String, CachedPluginHelp>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPluginHelp {
    plugin_name: String,
    help_text: String,
    timestamp: u64,
}

impl VolatilityRunner {
    /// 新しいVolatilityRunnerインスタンスを作成
    ///
    /// # Arguments
    /// * `volatility_dir` - Volatility 3のインストールディレクトリ（例: /opt/volatility3）
    ///
    /// インタプリタはVOLATILITY_PYTHON環境変数で指定（デフォルト: python3）
    pub fn new(volatility_dir: impl AsRef<Path>) -> Result<Self> {
        let volatility_dir = volatility_dir.as_ref().to_path_buf();

        // Volatilityの存在確認
        if !volatility_dir.exists() {
            return Err(anyhow::anyhow!(
                "Volatility not found at: {}. Please install Volatility 3 or set correct path",
                volatility_dir.display()
            ));
        }

        let script_path = volatility_dir.join("vol.py");
        if !script_path.exists() {
            return Err(anyhow::anyhow!(
                "vol.py not found. Expected at: {}",
                script_path.display()
            ));
        }

        let python = std::env::var("VOLATILITY_PYTHON")
            .unwrap_or_else(|_| "python3".to_string());

        Ok(Self {
            python,
            volatility_dir,
            script_path,
            cache_dir: PathBuf::from(".volatility_cache"),
            help_cache: Mutex::new(HashMap::new()),
        })
    }

    /// インタプリタを差し替え（テスト用）
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// キャッシュディレクトリを差し替え
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Volatilityコマンドを実行して出力を取得
    ///
    /// # Arguments
    /// * `args` - vol.pyに渡す引数列
    ///
    /// # Returns
    /// 正常終了時は標準出力。プラグイン側の失敗（非ゼロ終了）は
    /// 標準エラーをそのまま本文にしたエラーテキストを返す
    pub async fn run(&self, args: &[String]) -> Result<String> {
        tracing::debug!("Running Volatility with args: {:?}", args);

        let output = Command::new(&self.python)
            .arg(&self.script_path)
            .args(args)
            .current_dir(&self.volatility_dir)
            .output()
            .await
            .context("Failed to execute Volatility")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.is_empty() {
            tracing::warn!("Volatility stderr: {}", stderr);
        }

        if !output.status.success() {
            // 失敗は握りつぶさず、捕捉したエラーテキストをそのまま返す
            return Ok(format!("Error running Volatility command: {}", stderr));
        }

        Ok(stdout.into_owned())
    }

    /// 特定プラグインのヘルプを取得（キャッシュ優先）
    pub async fn plugin_help(&self, plugin: &str) -> Result<String> {
        // キャッシュチェック
        {
            let cache = self.help_cache.lock().unwrap();
            if let Some(cached) = cache.get(plugin) {
                tracing::info!("Cache hit for plugin help: {}", plugin);
                return Ok(cached.help_text.clone());
            }
        }

        tracing::info!("Cache miss, querying help for plugin: {}", plugin);

        let help_text = self
            .run(&[plugin.to_string(), "--help".to_string()])
            .await?;

        // キャッシュに保存
        {
            let mut cache = self.help_cache.lock().unwrap();
            cache.insert(
                plugin.to_string(),
                CachedPluginHelp {
                    plugin_name: plugin.to_string(),
                    help_text: help_text.clone(),
                    timestamp: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_secs(),
                },
            );
        }

        // ディスクにもキャッシュ
        self.save_cache_to_disk(plugin, &help_text)?;

        Ok(help_text)
    }

    /// キャッシュをディスクに保存
    fn save_cache_to_disk(&self, plugin: &str, help_text: &str) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;

        // プラグイン名にはパス区切りになり得る文字が含まれるためハッシュ化
        let cache_file = self
            .cache_dir
            .join(format!("{:016x}.json", xxh3_64(plugin.as_bytes())));

        let cached_data = CachedPluginHelp {
            plugin_name: plugin.to_string(),
            help_text: help_text.to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
        };

        let json = serde_json::to_string_pretty(&cached_data)?;
        fs::write(cache_file, json)?;

        Ok(())
    }

    /// ディスクからキャッシュをロード
    pub fn load_cache_from_disk(&self) -> Result<()> {
        if !self.cache_dir.exists() {
            return Ok(());
        }

        let mut cache = self.help_cache.lock().unwrap();

        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(cached_data) = serde_json::from_str::<CachedPluginHelp>(&content) {
                        cache.insert(cached_data.plugin_name.clone(), cached_data);
                    }
                }
            }
        }

        tracing::info!("Loaded {} cached plugin help entries from disk", cache.len());
        Ok(())
    }

    /// キャッシュクリア
    pub fn clear_cache(&self) -> Result<()> {
        let mut cache = self.help_cache.lock().unwrap();
        cache.clear();

        // ディスクキャッシュも削除
        if self.cache_dir.exists() {
            for entry in fs::read_dir(&self.cache_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    fs::remove_file(path)?;
                }
            }
        }

        tracing::info!("Plugin help cache cleared");
        Ok(())
    }

    /// キャッシュ統計取得
    pub fn cache_stats(&self) -> HashMap<String, usize> {
        let cache = self.help_cache.lock().unwrap();
        let mut stats = HashMap::new();
        stats.insert("total_entries".to_string(), cache.len());
        stats
    }
}

/// ヘルプ出力（vol.py -h）からプラグイン名の一覧を抽出
///
/// "Plugins" 見出しの次の行から、空行までをプラグイン名とみなす
pub fn parse_plugin_list(help_output: &str) -> Vec<String> {
    let mut plugins = Vec::new();
    let mut capture = false;

    for line in help_output.lines() {
        let trimmed = line.trim();
        if trimmed == "Plugins" {
            capture = true;
            continue;
        }
        if capture {
            if trimmed.is_empty() {
                break;
            }
            plugins.push(trimmed.to_string());
        }
    }

    plugins
}
