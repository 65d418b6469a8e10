use super::SharedState;
use crate::registry::{HostStats, Snapshot};
use axum::{extract::State, Json};

/// 主机内存与负载
pub async fn sys_status() -> Json<HostStats> {
    Json(HostStats::collect())
}

/// 获取工作站快照 API
/// 每个任务池的活动任务数，以及按启动时间从新到旧排列的任务
pub async fn workstation(State(state): State<SharedState>) -> Json<Snapshot> {
    Json(state.snapshot())
}
