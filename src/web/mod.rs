pub mod admin;

use crate::registry::Registry;
use axum::{routing::get, Router};
use std::sync::Arc;

pub type SharedState = Arc<Registry>;

/// 注册管理接口路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/workstation", get(admin::workstation)) // 任务池快照
        .with_state(state)
}
