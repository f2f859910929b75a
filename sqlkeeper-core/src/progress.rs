//! 进行中操作的进度登记
//!
//! 还原和备份各用一张表，以目标数据库名为键。每张表只有一把锁，每次读写只在这一次
//! 调用内持有，不会跨越引擎调用。每条记录只由发起它的执行器写入，记录中的
//! `operation_id` 用来防止过期任务覆盖同名的新操作。

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Restore,
    Backup,
}

/// 取消/确认请求的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// 已触发取消句柄，执行器会在下一个步骤边界停下
    CancelRequested,
    /// 终态记录已移除
    Removed,
    /// 记录已移除，未完成的还原目标库已删除
    RemovedAndDropped,
}

/// 一次备份或还原的可观察状态
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgress {
    pub operation_id: Uuid,
    pub status: OperationStatus,
    pub percentage: u8,
    pub current_item: String,
    pub completed_items: usize,
    pub total_items: usize,
    pub error_message: Option<String>,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    /// 备份操作写入的文件
    pub backup_file_path: Option<String>,
    /// 引擎中执行备份的会话
    pub session_id: Option<i64>,
    /// 还原是否已向目标库发出过 RESTORE 语句；未发出时取消/清理不能删除目标库
    pub target_touched: bool,
    #[serde(skip)]
    pub cancel_handle: Option<CancellationToken>,
}

fn percentage_of(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = completed.min(total) * 100 / total;
    u8::try_from(pct).unwrap_or(100)
}

impl OperationProgress {
    pub fn pending(
        current_item: impl Into<String>,
        total_items: usize,
        cancel_handle: Option<CancellationToken>,
    ) -> Self {
        Self {
            operation_id: Uuid::now_v7(),
            status: OperationStatus::Pending,
            percentage: 0,
            current_item: current_item.into(),
            completed_items: 0,
            total_items,
            error_message: None,
            start_time: Local::now(),
            end_time: None,
            backup_file_path: None,
            session_id: None,
            target_touched: false,
            cancel_handle,
        }
    }

    /// 开始第 completed+1 步：已完成步数、当前项与百分比一起更新
    pub fn begin_step(&mut self, completed: usize, item: impl Into<String>) {
        self.status = OperationStatus::InProgress;
        self.completed_items = completed;
        self.current_item = item.into();
        self.percentage = percentage_of(completed, self.total_items);
    }

    /// 只更新已完成步数，用于在步骤边界停下时
    pub fn set_completed(&mut self, completed: usize) {
        self.completed_items = completed;
        self.percentage = percentage_of(completed, self.total_items);
    }

    /// 进入终态；终态记录不再持有取消句柄
    pub fn finish(&mut self, status: OperationStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.end_time = Some(Local::now());
        self.cancel_handle = None;
        if status == OperationStatus::Completed {
            self.completed_items = self.total_items;
            self.percentage = 100;
        }
    }
}

/// 进度表的存取接口，可替换为测试替身
pub trait ProgressStore: Send + Sync {
    fn get(&self, name: &str) -> Option<OperationProgress>;

    /// 新操作覆盖同名旧记录
    fn set(&self, name: &str, progress: OperationProgress);

    /// 记录仍属于 `operation_id` 时才应用修改，返回是否已应用
    fn update(
        &self,
        name: &str,
        operation_id: Uuid,
        apply: &mut dyn FnMut(&mut OperationProgress),
    ) -> bool;

    fn remove(&self, name: &str) -> Option<OperationProgress>;
}

#[derive(Default)]
pub struct InMemoryProgressStore {
    entries: Mutex<HashMap<String, OperationProgress>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OperationProgress>> {
        // 持锁期间不会 panic 在半更新状态，中毒后继续使用
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn get(&self, name: &str) -> Option<OperationProgress> {
        self.lock().get(name).cloned()
    }

    fn set(&self, name: &str, progress: OperationProgress) {
        self.lock().insert(name.to_string(), progress);
    }

    fn update(
        &self,
        name: &str,
        operation_id: Uuid,
        apply: &mut dyn FnMut(&mut OperationProgress),
    ) -> bool {
        match self.lock().get_mut(name) {
            Some(entry) if entry.operation_id == operation_id => {
                apply(entry);
                true
            }
            _ => false,
        }
    }

    fn remove(&self, name: &str) -> Option<OperationProgress> {
        self.lock().remove(name)
    }
}

/// 还原表和备份表
#[derive(Clone)]
pub struct ProgressRegistry {
    restores: Arc<dyn ProgressStore>,
    backups: Arc<dyn ProgressStore>,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::with_stores(
            Arc::new(InMemoryProgressStore::new()),
            Arc::new(InMemoryProgressStore::new()),
        )
    }

    pub fn with_stores(restores: Arc<dyn ProgressStore>, backups: Arc<dyn ProgressStore>) -> Self {
        Self { restores, backups }
    }

    fn store(&self, kind: OperationKind) -> &Arc<dyn ProgressStore> {
        match kind {
            OperationKind::Restore => &self.restores,
            OperationKind::Backup => &self.backups,
        }
    }

    pub fn restores(&self) -> &Arc<dyn ProgressStore> {
        &self.restores
    }

    pub fn backups(&self) -> &Arc<dyn ProgressStore> {
        &self.backups
    }

    pub fn get(&self, kind: OperationKind, name: &str) -> Option<OperationProgress> {
        self.store(kind).get(name)
    }
}
