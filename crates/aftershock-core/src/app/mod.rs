//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてサーバーのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **ServerBuilder**: dispatcher と relay link の構築とワイヤリング
//! - **TaskDispatcher**: タスク実行ループ（poll→peek→claim→handle→commit）
//! - **HandlerTable**: Opcode → handler の対応表
//! - **RelayLink**: パートナーとの接続状態機械と resync
//! - **negotiation**: プライマリ/セカンダリ交渉（純粋関数）

pub mod builder;
pub mod dispatcher;
pub mod handler;
pub mod negotiation;
pub mod relay_link;
pub mod resync;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ServerBuilder};
pub use self::dispatcher::{
    CycleOutcome, DispatcherError, DispatcherHandle, IdleCallback, IdleContext, TaskDispatcher,
};
pub use self::handler::{
    DispatchContext, HandlerError, HandlerOutcome, HandlerTable, OpcodeHandler, RegistryError,
    Route, Staging, UnknownOpcodeHandler,
};
pub use self::negotiation::{LinkView, Liveness, NegotiationInput, negotiate};
pub use self::relay_link::{MergeError, RelayLink};
pub use self::resync::{ResyncCycle, ResyncPlan};
pub use self::status::{LinkStatusView, ServerReport};
