//! 每个 (worker, partition) 已应用的最大序列号。
//!
//! 偏移与消息的副作用写在同一个事务里提交，保证每条消息恰好生效一次。

use std::sync::Arc;

use crate::error::{KvError, SequenceError};
use crate::meta;
use crate::storage::{Driver, Txn};

/// 收到一条消息时的判定结果
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeqCheck {
    Apply,
    /// 序列号不大于已存偏移：跳过
    AlreadyApplied { last: u64 },
    /// 出现空洞：照常应用，只记录告警
    Gap { expected: u64, got: u64 },
}

pub fn check(last: Option<u64>, incoming: u64) -> SeqCheck {
    match last {
        Some(last) if incoming <= last => SeqCheck::AlreadyApplied { last },
        Some(last) if incoming > last + 1 => SeqCheck::Gap {
            expected: last + 1,
            got: incoming,
        },
        _ => SeqCheck::Apply,
    }
}

pub struct SequenceManager {
    driver: Arc<dyn Driver>,
    worker: String,
}

impl SequenceManager {
    pub fn new(driver: Arc<dyn Driver>, worker: &str) -> Self {
        Self {
            driver,
            worker: worker.to_string(),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub async fn get_last(&self, partition: &str) -> Result<Option<u64>, KvError> {
        let mut txn = self.driver.begin(true).await?;
        let last = self.get_last_in(&mut txn, partition).await?;
        txn.commit().await?;
        Ok(last)
    }

    pub async fn get_last_in(
        &self,
        txn: &mut Txn,
        partition: &str,
    ) -> Result<Option<u64>, KvError> {
        meta::workers::get_offset(txn, &self.worker, partition).await
    }

    /// 在调用方事务内推进偏移；不大于已存值的写入是缺陷，拒绝并记 error
    pub async fn set_last(
        &self,
        txn: &mut Txn,
        partition: &str,
        seqid: u64,
    ) -> Result<(), SequenceError> {
        if let Some(stored) = self.get_last_in(txn, partition).await? {
            if seqid <= stored {
                tracing::error!(
                    "Sequence regression: worker={} partition={} stored={} attempted={}",
                    self.worker,
                    partition,
                    stored,
                    seqid
                );
                return Err(SequenceError::Regression {
                    worker: self.worker.clone(),
                    partition: partition.to_string(),
                    stored,
                    attempted: seqid,
                });
            }
        }
        meta::workers::set_offset(txn, &self.worker, partition, seqid).await?;
        Ok(())
    }

    /// 为一条消息开启读写事务。
    ///
    /// 已应用过的消息返回 None（事务已中止，副作用不得执行）；否则返回的
    /// `MessageTxn` 承载副作用写入，`commit()` 时连同新偏移一起提交。
    pub async fn begin_message(
        &self,
        partition: &str,
        seqid: u64,
    ) -> Result<Option<MessageTxn<'_>>, SequenceError> {
        let mut txn = self.driver.begin(false).await?;
        let last = self.get_last_in(&mut txn, partition).await?;
        match check(last, seqid) {
            SeqCheck::AlreadyApplied { last } => {
                tracing::debug!(
                    "Skipping already applied message: worker={} partition={} seqid={} last={}",
                    self.worker,
                    partition,
                    seqid,
                    last
                );
                txn.abort().await?;
                return Ok(None);
            }
            SeqCheck::Gap { expected, got } => {
                tracing::warn!(
                    "Sequence gap: worker={} partition={} expected={} got={}",
                    self.worker,
                    partition,
                    expected,
                    got
                );
            }
            SeqCheck::Apply => {}
        }
        Ok(Some(MessageTxn {
            manager: self,
            txn,
            partition: partition.to_string(),
            seqid,
        }))
    }
}

pub struct MessageTxn<'a> {
    manager: &'a SequenceManager,
    txn: Txn,
    partition: String,
    seqid: u64,
}

impl MessageTxn<'_> {
    pub fn txn(&mut self) -> &mut Txn {
        &mut self.txn
    }

    pub fn seqid(&self) -> u64 {
        self.seqid
    }

    pub async fn commit(mut self) -> Result<(), SequenceError> {
        self.manager
            .set_last(&mut self.txn, &self.partition, self.seqid)
            .await?;
        self.txn.commit().await?;
        Ok(())
    }
}
