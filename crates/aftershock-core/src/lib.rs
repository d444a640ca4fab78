//! aftershock-core
//!
//! Scheduling core of a dual-server aftershock forecast service: a task
//! dispatcher that drains a persistent queue, and a relay link that keeps
//! two servers replicated and decides which one is primary.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（task, opcode, rescode, relay item, server status, state enums）
//! - **ports**: 抽象化レイヤー（TaskQueue, RelayStore, RelayTransport, Connector, Clock, RoleListener）
//! - **queue**: インメモリのタスクキューとリトライ方針
//! - **impls**: 実装（InMemoryRelayStore, InMemoryDatabase, ChannelRelayTransport など開発用）
//! - **app**: アプリケーションロジック（builder, dispatcher, handler table, relay link, negotiation）
//! - **config**: TOML 設定と再読み込み
//! - **error**: 境界ごとのエラー型とその分類
//! - **observability**: tracing の初期化と状態表示用カウンタ

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use error::{AftershockError, ErrorKind};
