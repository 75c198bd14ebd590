use super::config::Config;
use super::tasks::{BackgroundTasks, TaskKind};
use crate::clients::{AutomationClient, InventoryClient, NotifyClient};
use crate::informer::{Informer, InformerDeps, InformerKey, InformerSpec, kinds};
use crate::lock::{CacheStore, MemoryCache};
use crate::matcher::{Matcher, MatcherDeps};
use crate::reconciler::{
    NoticeReconciler, OrderReconciler, Reconcile, TicketReconciler, run_reconciler,
};
use crate::store::{JournalCompactor, RedbStore};
use shared::{AppError, AppResult};
use std::sync::Arc;

/// 调度器状态 - 持有所有共享服务
///
/// | 字段 | 说明 |
/// |------|------|
/// | config | 启动配置 |
/// | store | redb 存储 + 变更流 + 续传令牌 |
/// | cache | 锁使用的缓存 |
/// | matcher | 匹配流水线 |
#[derive(Clone)]
pub struct SchedulerState {
    pub config: Config,
    pub store: Arc<RedbStore>,
    pub cache: Arc<dyn CacheStore>,
    pub matcher: Arc<Matcher>,
}

impl SchedulerState {
    /// 初始化调度器状态
    ///
    /// 创建工作目录、打开数据库、构建外部服务客户端
    pub fn initialize(config: &Config) -> AppResult<Self> {
        std::fs::create_dir_all(&config.work_dir).map_err(|e| {
            AppError::config(format!("failed to create work dir {}: {e}", config.work_dir))
        })?;

        let db_path = config.database_path();
        tracing::info!(path = %db_path.display(), "Opening database");
        let store = Arc::new(RedbStore::open(&db_path)?);

        let timeout = config.http_timeout();
        let deps = MatcherDeps {
            store: store.clone(),
            automation: Arc::new(AutomationClient::new(&config.automation_api_url, timeout)?),
            inventory: Arc::new(InventoryClient::new(&config.inventory_api_url, timeout)?),
            notify: Arc::new(NotifyClient::new(&config.notify_api_url, timeout)?),
        };

        let matcher = Arc::new(Matcher::new(deps, config.matcher_options()));
        Ok(Self::with_matcher(
            config.clone(),
            store,
            Arc::new(MemoryCache::new()),
            matcher,
        ))
    }

    /// 使用已构建的匹配器组装状态 (测试中注入 mock)
    pub fn with_matcher(
        config: Config,
        store: Arc<RedbStore>,
        cache: Arc<dyn CacheStore>,
        matcher: Arc<Matcher>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            matcher,
        }
    }

    fn informer_deps(&self) -> InformerDeps {
        InformerDeps {
            store: self.store.clone(),
            feed: self.store.clone(),
            tokens: self.store.clone(),
        }
    }

    async fn start_informer<K: InformerKey>(
        &self,
        spec: InformerSpec<K>,
        tasks: &mut BackgroundTasks,
    ) -> AppResult<Arc<Informer<K>>> {
        let informer = Informer::start(spec, self.informer_deps(), self.config.watch_options()).await?;
        let token = tasks.shutdown_token();
        let watcher = informer.clone();
        tasks.spawn(format!("informer:{}", informer.name()), TaskKind::Watcher, async move {
            // Errors are logged by the informer; the queue is closed either way
            let _ = watcher.run(token).await;
        });
        Ok(informer)
    }

    fn spawn_reconciler<K: InformerKey>(
        &self,
        reconciler: Arc<dyn Reconcile<K>>,
        informer: &Informer<K>,
        tasks: &mut BackgroundTasks,
    ) {
        let name = format!("reconciler:{}", reconciler.name());
        let queue = informer.queue();
        let token = tasks.shutdown_token();
        tasks.spawn(name, TaskKind::Reconciler, run_reconciler(reconciler, queue, token));
    }

    /// 启动后台任务
    ///
    /// 启动的任务：
    /// - 四个 informer 的变更订阅 (订单、工单、生产记录、通知)
    /// - `match_workers` 个匹配工作者
    /// - 订单、工单、通知协调器
    /// - 变更日志清理
    ///
    /// 任一 informer 初始列举失败即返回错误。
    pub async fn start_background_tasks(&self, tasks: &mut BackgroundTasks) -> AppResult<()> {
        let orders = self.start_informer(kinds::order(), tasks).await?;
        let tickets = self.start_informer(kinds::ticket(), tasks).await?;
        let generates = self.start_informer(kinds::generate(), tasks).await?;
        let notices = self.start_informer(kinds::notice(), tasks).await?;

        for worker in 0..self.matcher.options().workers {
            let matcher = self.matcher.clone();
            let informer = generates.clone();
            let token = tasks.shutdown_token();
            tasks.spawn(
                format!("matcher-{worker}"),
                TaskKind::Worker,
                matcher.run_worker(worker, informer, orders.queue(), token),
            );
        }

        let lock_ttl = self.config.lock_ttl();
        let order: Arc<dyn Reconcile<String>> = Arc::new(
            OrderReconciler::new(self.matcher.clone(), self.cache.clone(), lock_ttl)
                .with_ticket_queue(tickets.queue())
                .with_generate_queue(generates.queue()),
        );
        self.spawn_reconciler(order, &orders, tasks);

        let ticket: Arc<dyn Reconcile<u64>> = Arc::new(TicketReconciler::new(
            self.store.clone(),
            self.cache.clone(),
            lock_ttl,
        ));
        self.spawn_reconciler(ticket, &tickets, tasks);

        let notice: Arc<dyn Reconcile<u64>> = Arc::new(NoticeReconciler::new(
            self.store.clone(),
            self.matcher.deps().notify.clone(),
        ));
        self.spawn_reconciler(notice, &notices, tasks);

        let mut compactor =
            JournalCompactor::new(self.store.clone(), self.config.journal_compact_interval());
        for (collection, token_key) in [
            orders.watch_position(),
            tickets.watch_position(),
            generates.watch_position(),
            notices.watch_position(),
        ] {
            compactor = compactor.watch(collection, token_key);
        }
        let token = tasks.shutdown_token();
        tasks.spawn("journal-compactor", TaskKind::Maintenance, compactor.run(token));

        tasks.log_summary();
        Ok(())
    }
}
