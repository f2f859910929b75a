//! 单元测试使用的内存引擎

use crate::engine::{Engine, Row};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Trigger<T> {
    pattern: String,
    /// 第几次匹配时触发，从 1 开始
    nth: usize,
    action: T,
}

#[derive(Default)]
struct FakeState {
    statements: Vec<String>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<Trigger<EngineError>>,
    cancels: Vec<Trigger<CancellationToken>>,
    delays: Vec<(String, Duration)>,
}

/// 记录所有语句的引擎替身，可以按语句片段返回结果、注入错误或触发取消
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// 包含 pattern 的查询返回 rows；后注册的优先
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.lock().responses.push((pattern.to_string(), rows));
    }

    /// 第 nth 条包含 pattern 的语句返回错误
    pub fn fail_on(&self, pattern: &str, nth: usize, error: EngineError) {
        self.lock().failures.push(Trigger {
            pattern: pattern.to_string(),
            nth,
            action: error,
        });
    }

    /// 第 nth 条包含 pattern 的语句执行完成后触发取消
    pub fn cancel_on(&self, pattern: &str, nth: usize, token: CancellationToken) {
        self.lock().cancels.push(Trigger {
            pattern: pattern.to_string(),
            nth,
            action: token,
        });
    }

    /// 包含 pattern 的语句执行前等待
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.lock().delays.push((pattern.to_string(), delay));
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.lock()
            .statements
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }

    async fn handle(&self, sql: &str) -> Result<Vec<Row>> {
        let delay = {
            let state = self.lock();
            state
                .delays
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, d)| *d)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.statements.push(sql.to_string());

        let occurrences = |pattern: &str| {
            state
                .statements
                .iter()
                .filter(|s| s.contains(pattern))
                .count()
        };

        if let Some(trigger) = state
            .failures
            .iter()
            .find(|t| sql.contains(t.pattern.as_str()) && occurrences(&t.pattern) == t.nth)
        {
            return Err(trigger.action.clone().into());
        }

        for trigger in &state.cancels {
            if sql.contains(trigger.pattern.as_str()) && occurrences(&trigger.pattern) == trigger.nth {
                trigger.action.cancel();
            }
        }

        Ok(state
            .responses
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.handle(sql).await.map(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.handle(sql).await
    }
}
