/// Volatility-MCP ライブラリ
///
/// Volatility 3のメモリフォレンジックプラグインをMCPツールとして提供

pub mod volatility_runner;
pub mod tools;

// メモリダンプファイル探索
pub mod dump_scanner;
