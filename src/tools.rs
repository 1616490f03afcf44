use crate::dump_scanner;
use crate::volatility_runner::VolatilityRunner;
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// ツール実行時のドメインエラー
///
/// プロトコルエラー（不正なリクエスト等）とは区別され、
/// サーバーはこれをツール結果のテキストとしてそのまま呼び出し元へ返す
#[derive(Debug, Error)]
pub enum VolatilityError {
    #[error("Error: Memory dump file not found at {0}")]
    DumpNotFound(String),

    #[error("Error: Directory not found at {0}")]
    DirNotFound(String),

    #[error("Error creating dump directory: {0}")]
    DumpDirCreation(String),

    #[error("Error scanning for memory dumps: {0}")]
    Io(String),

    #[error("Exception running Volatility: {0}")]
    Spawn(String),

    #[error("Error: Unknown tool {0}")]
    UnknownTool(String),
}

/// ダンプパス指定のみで実行できる組み込みツールとプラグインの対応表
pub fn builtin_plugins() -> IndexMap<&'static str, &'static str> {
    IndexMap::from([
        ("get_image_info", "windows.info.Info"),
        ("run_pstree", "windows.pstree.PsTree"),
        ("run_pslist", "windows.pslist.PsList"),
        ("run_psscan", "windows.psscan.PsScan"),
        ("run_netscan", "windows.netscan.NetScan"),
        ("run_cmdline", "windows.cmdline.CmdLine"),
        ("run_filescan", "windows.filescan.FileScan"),
    ])
}

/// フォレンジックツール層
///
/// 各ツールを対応するVolatilityプラグイン呼び出しへ変換する
pub struct VolatilityTools {
    runner: Arc<VolatilityRunner>,
}

impl VolatilityTools {
    pub fn new(runner: Arc<VolatilityRunner>) -> Self {
        Self { runner }
    }

    /// 利用可能なVolatilityプラグイン一覧を取得
    pub async fn list_available_plugins(&self) -> Result<String, VolatilityError> {
        self.run(vec!["-h".to_string()]).await
    }

    /// 組み込みツールを実行（対応表からプラグイン名を引く）
    pub async fn run_builtin(&self, tool: &str, dump: &str) -> Result<String, VolatilityError> {
        match builtin_plugins().get(tool) {
            Some(plugin) => self.run_plugin(dump, plugin).await,
            None => Err(VolatilityError::UnknownTool(tool.to_string())),
        }
    }

    /// DllListプラグイン実行（PIDで絞り込み可能）
    pub async fn run_dlllist(
        &self,
        dump: &str,
        pid: Option<u32>,
    ) -> Result<String, VolatilityError> {
        validate_dump_path(dump)?;
        self.run(pid_args(dump, "windows.dlllist.DllList", pid)).await
    }

    /// Handlesプラグイン実行（PIDで絞り込み可能）
    pub async fn run_handles(
        &self,
        dump: &str,
        pid: Option<u32>,
    ) -> Result<String, VolatilityError> {
        validate_dump_path(dump)?;
        self.run(pid_args(dump, "windows.handles.Handles", pid)).await
    }

    /// MemMapプラグイン実行（PID必須）
    pub async fn run_memmap(&self, dump: &str, pid: u32) -> Result<String, VolatilityError> {
        validate_dump_path(dump)?;
        self.run(pid_args(dump, "windows.memmap.Memmap", Some(pid))).await
    }

    /// MalFindプラグイン実行
    ///
    /// dump_dirを指定すると不審なメモリセクションをそこへ書き出し、
    /// 結果末尾に書き出したファイル数のサマリーを追記する
    pub async fn run_malfind(
        &self,
        dump: &str,
        dump_dir: Option<&str>,
    ) -> Result<String, VolatilityError> {
        validate_dump_path(dump)?;

        if let Some(dir) = dump_dir {
            if !Path::new(dir).is_dir() {
                fs::create_dir_all(dir)
                    .map_err(|e| VolatilityError::DumpDirCreation(e.to_string()))?;
            }
        }

        let mut result = self.run(malfind_args(dump, dump_dir)).await?;

        if let Some(dir) = dump_dir {
            if let Ok(entries) = fs::read_dir(dir) {
                let dumped = entries.filter_map(|e| e.ok()).count();
                if dumped > 0 {
                    result.push_str(&format!(
                        "\n\nDumped {} suspicious memory sections to {}",
                        dumped, dir
                    ));
                }
            }
        }

        Ok(result)
    }

    /// 任意のVolatilityプラグインを実行
    ///
    /// # Arguments
    /// * `plugin` - プラグイン名（例: linux.pslist.PsList）
    /// * `additional_args` - 空白区切りの追加引数
    pub async fn run_custom_plugin(
        &self,
        dump: &str,
        plugin: &str,
        additional_args: &str,
    ) -> Result<String, VolatilityError> {
        validate_dump_path(dump)?;
        self.run(custom_args(dump, plugin, additional_args)).await
    }

    /// ディレクトリ内のメモリダンプファイルを一覧化
    ///
    /// search_dir省略時はカレントディレクトリを探索する
    pub fn list_memory_dumps(&self, search_dir: Option<&str>) -> Result<String, VolatilityError> {
        let dir = match search_dir {
            Some(d) => PathBuf::from(d),
            None => std::env::current_dir().map_err(|e| VolatilityError::Io(e.to_string()))?,
        };

        if !dir.is_dir() {
            return Err(VolatilityError::DirNotFound(dir.display().to_string()));
        }

        let files =
            dump_scanner::scan(&dir).map_err(|e| VolatilityError::Io(e.to_string()))?;

        Ok(dump_scanner::format_listing(&dir, &files))
    }

    async fn run_plugin(&self, dump: &str, plugin: &str) -> Result<String, VolatilityError> {
        validate_dump_path(dump)?;
        self.run(dump_args(dump, plugin)).await
    }

    async fn run(&self, args: Vec<String>) -> Result<String, VolatilityError> {
        self.runner
            .run(&args)
            .await
            .map_err(|e| VolatilityError::Spawn(e.to_string()))
    }
}

/// ダンプファイルが実在する通常ファイルであることを確認
fn validate_dump_path(dump: &str) -> Result<(), VolatilityError> {
    if !Path::new(dump).is_file() {
        return Err(VolatilityError::DumpNotFound(dump.to_string()));
    }
    Ok(())
}

// ---- 引数組み立て（引数の並び順はテストで固定） ----

fn dump_args(dump: &str, plugin: &str) -> Vec<String> {
    vec!["-f".to_string(), dump.to_string(), plugin.to_string()]
}

fn pid_args(dump: &str, plugin: &str, pid: Option<u32>) -> Vec<String> {
    let mut args = dump_args(dump, plugin);
    if let Some(pid) = pid {
        args.push("--pid".to_string());
        args.push(pid.to_string());
    }
    args
}

fn malfind_args(dump: &str, dump_dir: Option<&str>) -> Vec<String> {
    let mut args = dump_args(dump, "windows.malfind.Malfind");
    if let Some(dir) = dump_dir {
        args.push("--dump-dir".to_string());
        args.push(dir.to_string());
    }
    args
}

fn custom_args(dump: &str, plugin: &str, additional_args: &str) -> Vec<String> {
    let mut args = vec!["-f".to_string(), dump.to_string(), plugin.to_string()];
    args.extend(additional_args.split_whitespace().map(str::to_string));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_tools() -> (TempDir, VolatilityTools) {
        let dir = TempDir::new().unwrap();
        let mut script = fs::File::create(dir.path().join("vol.py")).unwrap();
        writeln!(script, "echo stub").unwrap();

        let runner = VolatilityRunner::new(dir.path())
            .unwrap()
            .with_python("/bin/sh")
            .with_cache_dir(dir.path().join("cache"));

        (dir, VolatilityTools::new(Arc::new(runner)))
    }

    #[test]
    fn test_builtin_plugin_mapping() {
        let plugins = builtin_plugins();
        assert_eq!(plugins["get_image_info"], "windows.info.Info");
        assert_eq!(plugins["run_pstree"], "windows.pstree.PsTree");
        assert_eq!(plugins["run_pslist"], "windows.pslist.PsList");
        assert_eq!(plugins["run_psscan"], "windows.psscan.PsScan");
        assert_eq!(plugins["run_netscan"], "windows.netscan.NetScan");
        assert_eq!(plugins["run_cmdline"], "windows.cmdline.CmdLine");
        assert_eq!(plugins["run_filescan"], "windows.filescan.FileScan");
        assert_eq!(plugins.len(), 7);
    }

    #[test]
    fn test_dump_args_order() {
        for (_, plugin) in builtin_plugins() {
            assert_eq!(
                dump_args("mem.raw", plugin),
                vec!["-f".to_string(), "mem.raw".to_string(), plugin.to_string()]
            );
        }
    }

    #[test]
    fn test_pid_args() {
        assert_eq!(
            pid_args("mem.raw", "windows.dlllist.DllList", None),
            vec!["-f", "mem.raw", "windows.dlllist.DllList"]
        );
        assert_eq!(
            pid_args("mem.raw", "windows.memmap.Memmap", Some(42)),
            vec!["-f", "mem.raw", "windows.memmap.Memmap", "--pid", "42"]
        );
    }

    #[test]
    fn test_malfind_args() {
        assert_eq!(
            malfind_args("mem.raw", None),
            vec!["-f", "mem.raw", "windows.malfind.Malfind"]
        );
        assert_eq!(
            malfind_args("mem.raw", Some("/tmp/out")),
            vec![
                "-f",
                "mem.raw",
                "windows.malfind.Malfind",
                "--dump-dir",
                "/tmp/out"
            ]
        );
    }

    #[test]
    fn test_custom_args_splits_whitespace() {
        assert_eq!(
            custom_args("mem.raw", "linux.bash.Bash", "--pid 4  --include-empty"),
            vec![
                "-f",
                "mem.raw",
                "linux.bash.Bash",
                "--pid",
                "4",
                "--include-empty"
            ]
        );
        // 空の追加引数は何も加えない
        assert_eq!(
            custom_args("mem.raw", "linux.bash.Bash", ""),
            vec!["-f", "mem.raw", "linux.bash.Bash"]
        );
    }

    #[test]
    fn test_validate_dump_path() {
        let err = validate_dump_path("/no/such/dump.raw").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error: Memory dump file not found at /no/such/dump.raw"
        );

        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(validate_dump_path(file.path().to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_missing_dump_is_domain_error() {
        let (_dir, tools) = test_tools();
        let err = tools
            .run_builtin("run_pslist", "/no/such/dump.raw")
            .await
            .unwrap_err();
        assert!(matches!(err, VolatilityError::DumpNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_builtin_tool() {
        let (_dir, tools) = test_tools();
        let err = tools.run_builtin("run_timeline", "mem.raw").await.unwrap_err();
        assert!(matches!(err, VolatilityError::UnknownTool(_)));
    }

    #[test]
    fn test_list_memory_dumps_missing_dir() {
        let (_dir, tools) = test_tools();
        let err = tools.list_memory_dumps(Some("/no/such/dir")).unwrap_err();
        assert_eq!(err.to_string(), "Error: Directory not found at /no/such/dir");
    }

    #[tokio::test]
    async fn test_malfind_creates_dump_dir_and_appends_summary() {
        let (dir, tools) = test_tools();

        let dump = dir.path().join("memory.raw");
        fs::write(&dump, b"fake dump").unwrap();

        let out_dir = dir.path().join("sections");
        // プラグイン実行を装って書き出しファイルを先に用意
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(out_dir.join("pid.4.dmp"), b"x").unwrap();
        fs::write(out_dir.join("pid.8.dmp"), b"x").unwrap();

        let result = tools
            .run_malfind(
                dump.to_str().unwrap(),
                Some(out_dir.to_str().unwrap()),
            )
            .await
            .unwrap();

        assert!(result.contains("Dumped 2 suspicious memory sections"));
    }
}
