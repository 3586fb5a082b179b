//! 代理生命周期内核 / The broker lifecycle kernel.

pub mod entry;
pub mod message;
pub mod recovery;
pub mod registry;
pub mod timer;
pub mod traits;

use std::sync::Arc;

use log::info;

use entry::MessageEntry;
use message::{next_receive_timestamp, MessageUnit};
use recovery::ErrorRecoveryHandler;
use registry::TopicRegistry;
use timer::ExpiryTimer;
use traits::DeadLetterPublisher;

/// 内核配置 / Kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// 每次非零引用计数变化向所属主题做脏读传播
    ///
    /// Propagate every nonzero reference count change to the owning topic via
    /// a dirty read. Off by default: most deployments only care about the
    /// zero crossing.
    pub strict_reference_counting: bool,
    /// 延迟销毁队列的容量；满时生产者阻塞 / Capacity of the deferred-destroy
    /// queue; the producer blocks when it is full.
    pub destroy_queue_capacity: usize,
    pub(crate) async_destroy: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            strict_reference_counting: false,
            destroy_queue_capacity: 10_000,
            async_destroy: false,
        }
    }
}

impl KernelConfig {
    pub fn with_strict_reference_counting(mut self) -> Self {
        self.strict_reference_counting = true;
        self
    }

    /// 把条目销毁工作转移到单一后台消费者上串行执行
    ///
    /// Offload entry destruction work to a single background consumer that
    /// runs it serially. Requires a Tokio runtime context at engine creation.
    #[cfg(feature = "async-destroy")]
    pub fn with_async_destroy(mut self) -> Self {
        self.async_destroy = true;
        self
    }
}

/// 内核门面：注册表、定时器服务与条目工厂
///
/// Kernel facade: the registry, the timer service and the entry factory.
/// Clonable; all clones share the same inner state.
#[derive(Clone)]
pub struct BrokerEngine {
    registry: TopicRegistry,
    timer: Arc<ExpiryTimer>,
    config: KernelConfig,
}

impl Default for BrokerEngine {
    fn default() -> Self {
        BrokerEngine::new()
    }
}

impl BrokerEngine {
    pub fn new() -> Self {
        BrokerEngine::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        info!("生命周期内核已启动 / Lifecycle kernel started");
        BrokerEngine {
            registry: TopicRegistry::new(&config),
            timer: Arc::new(ExpiryTimer::new()),
            config,
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn timer(&self) -> &Arc<ExpiryTimer> {
        &self.timer
    }

    /// 创建条目并挂接到其主题（必要时创建主题），不启动到期定时器
    ///
    /// Create an entry and attach it to its topic (creating the topic if
    /// needed) without starting the expiry timer. Missing receive timestamps
    /// are stamped here.
    pub async fn create_entry(
        &self,
        mut unit: MessageUnit,
        references: i64,
        history_references: i64,
    ) -> anyhow::Result<Arc<MessageEntry>> {
        if unit.qos.rcv_timestamp.is_none() {
            unit.qos.rcv_timestamp = Some(next_receive_timestamp());
        }
        let handle = self.registry.find_or_create(unit.oid()).await;
        let entry = MessageEntry::new(
            Arc::downgrade(self.registry.core()),
            self.timer.clone(),
            unit,
            references,
            history_references,
            None,
            self.config.strict_reference_counting,
        )?;
        handle.attach_entry(entry.clone());
        self.registry.release(&handle).await;
        Ok(entry)
    }

    /// 发布：创建条目并立即启动到期定时器 / Publish: create the entry and start
    /// its expiry timer right away.
    pub async fn publish(
        &self,
        unit: MessageUnit,
        references: i64,
        history_references: i64,
    ) -> anyhow::Result<Arc<MessageEntry>> {
        let entry = self.create_entry(unit, references, history_references).await?;
        entry.start_expiry_timer();
        Ok(entry)
    }

    /// 构造故障恢复处理器 / Build the failure recovery handler.
    pub fn recovery_handler(
        &self,
        dead_letters: Arc<dyn DeadLetterPublisher>,
    ) -> ErrorRecoveryHandler {
        ErrorRecoveryHandler::new(self.registry.clone(), dead_letters)
    }

    /// 诊断转储 / Diagnostic dump.
    pub async fn dump(&self) -> String {
        self.registry.dump().await
    }
}
