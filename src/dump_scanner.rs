/// メモリダンプ探索 - ディレクトリからダンプ候補ファイルを発見
///
/// フォレンジックで一般的なダンプ拡張子を再帰的に検索する

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use walkdir::WalkDir;

/// 認識するメモリダンプ拡張子（大文字小文字は区別しない）
pub const DUMP_EXTENSIONS: [&str; 8] =
    ["raw", "vmem", "dmp", "mem", "bin", "img", "001", "dump"];

/// 発見したダンプファイルの情報
#[derive(Debug, Clone, Serialize)]
pub struct DumpFileInfo {
    pub path: String,
    pub size_bytes: u64,
    pub size_mb: f64,
}

/// パスがメモリダンプ拡張子を持つか判定
pub fn has_dump_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            DUMP_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// ディレクトリを再帰的に探索してダンプ候補を収集
///
/// 読み取れないサブディレクトリはスキップする（致命的にしない）
pub fn scan(dir: &Path) -> Result<Vec<DumpFileInfo>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if !has_dump_extension(entry.path()) {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            let size_bytes = metadata.len();
            files.push(DumpFileInfo {
                path: entry.path().display().to_string(),
                size_bytes,
                size_mb: size_bytes as f64 / (1024.0 * 1024.0),
            });
        }
    }

    Ok(files)
}

/// 探索結果を人間が読めるリストに整形
pub fn format_listing(dir: &Path, files: &[DumpFileInfo]) -> String {
    if files.is_empty() {
        return format!("No memory dump files found in {}", dir.display());
    }

    let mut lines = vec!["Found memory dump files:".to_string()];
    for file in files {
        lines.push(format!("{} (Size: {:.2} MB)", file.path, file.size_mb));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_has_dump_extension() {
        assert!(has_dump_extension(Path::new("memory.raw")));
        assert!(has_dump_extension(Path::new("MEMORY.VMEM")));
        assert!(has_dump_extension(Path::new("image.001")));
        assert!(!has_dump_extension(Path::new("notes.txt")));
        assert!(!has_dump_extension(Path::new("no_extension")));
        assert!(!has_dump_extension(Path::new("archive.raw.gz")));
    }

    #[test]
    fn test_scan_finds_only_dump_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.raw"), vec![0u8; 1024]).unwrap();
        fs::write(dir.path().join("b.VMEM"), b"x").unwrap();
        fs::write(dir.path().join("c.txt"), b"x").unwrap();
        fs::write(dir.path().join("no_extension"), b"x").unwrap();

        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("d.dmp"), b"x").unwrap();

        let mut found = scan(dir.path()).unwrap();
        found.sort_by(|a, b| a.path.cmp(&b.path));

        let names: Vec<&str> = found.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(found.len(), 3);
        assert!(names[0].ends_with("a.raw"));
        assert!(names[1].ends_with("b.VMEM"));
        assert!(names[2].ends_with("d.dmp"));

        assert_eq!(found[0].size_bytes, 1024);
    }

    #[test]
    fn test_format_listing() {
        let info = DumpFileInfo {
            path: "/dumps/memory.raw".to_string(),
            size_bytes: 2 * 1024 * 1024,
            size_mb: 2.0,
        };

        let listing = format_listing(Path::new("/dumps"), &[info]);
        assert!(listing.starts_with("Found memory dump files:"));
        assert!(listing.contains("/dumps/memory.raw (Size: 2.00 MB)"));
    }

    #[test]
    fn test_format_listing_empty() {
        let dir = TempDir::new().unwrap();
        let files = scan(dir.path()).unwrap();
        assert!(files.is_empty());

        let listing = format_listing(dir.path(), &files);
        assert!(listing.starts_with("No memory dump files found in"));
    }
}
