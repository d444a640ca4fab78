//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryRelayStore**: 開発用のリレーログ
//! - **InMemoryDatabase**: タスクキューとリレーログを束ねた `Connector`
//! - **ChannelRelayTransport**: tokio タスク + チャネルによる転送ワーカー
//! - **TaskRoleListener**: 役割変更時のタスク整理
//!
//! タスクキューの実装は `queue::InMemoryTaskQueue` にあります。

pub mod channel_transport;
pub mod inmem_database;
pub mod inmem_relay;
pub mod role_tasks;

pub use self::channel_transport::ChannelRelayTransport;
pub use self::inmem_database::InMemoryDatabase;
pub use self::inmem_relay::InMemoryRelayStore;
pub use self::role_tasks::TaskRoleListener;
