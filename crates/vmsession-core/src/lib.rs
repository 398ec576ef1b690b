//! vmsession-core
//!
//! Core building blocks for VM session management.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（SessionId, SessionState, HvStatus）
//! - **progress**: 階層的な進捗ツリー（FiniteTask, VariableTask, BooleanTask）
//! - **fsm**: 自己ルーティングする状態機械（グラフ、最短経路、ワーカースレッド）
//! - **ports**: 抽象化レイヤー（HypervisorControl, DownloadProvider, Clock）
//! - **impls**: 実装（SimulatedHypervisor, StaticDownloadProvider など開発用）
//! - **session**: VM ライフサイクル（グラフ、アクション、エラー回復）
//! - **retry**: コマンド再試行のバックオフ
//! - **observability**: status views

pub mod domain;
pub mod fsm;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod progress;
pub mod retry;
pub mod session;
