#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use keel_recovery::{
    AriesRecoveryManager, BufferManager, DiskSpaceManager, FlushHooks, LogManager,
    LogManagerConfig, LogRecord, Lsn, MemoryLogStorage, MemoryStore, PageNum, RecoveryConfig,
    page_num,
};
use keel_transaction::{
    Transaction, TransactionContext, TransactionFactory, TxnNum, TxnNumGenerator,
};
use parking_lot::Mutex;

/// Data partition every test database starts with.
pub const DATA_PARTITION: u32 = 1;
pub const NUM_PAGES: u32 = 8;

pub fn page(index: u32) -> PageNum {
    page_num(DATA_PARTITION, index)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum LogSource {
    Memory(MemoryLogStorage),
    File(LogManagerConfig),
}

impl LogSource {
    fn open(&self) -> LogManager {
        match self {
            LogSource::Memory(storage) => LogManager::open(Box::new(storage.clone())).unwrap(),
            LogSource::File(config) => LogManager::with_config(config).unwrap(),
        }
    }
}

/// A recovery manager over an in-memory store that can be crashed and
/// reopened.
pub struct TestDb {
    pub store: Arc<MemoryStore>,
    pub rm: Arc<AriesRecoveryManager>,
    config: RecoveryConfig,
    log: LogSource,
    /// Handles the recovery manager built for transactions found in the log.
    restored: Arc<Mutex<HashMap<TxnNum, Arc<TransactionContext>>>>,
    trans_nums: Arc<TxnNumGenerator>,
}

impl TestDb {
    pub fn new() -> Self {
        Self::create(
            RecoveryConfig::default(),
            LogSource::Memory(MemoryLogStorage::new()),
        )
    }

    pub fn with_config(config: RecoveryConfig) -> Self {
        Self::create(config, LogSource::Memory(MemoryLogStorage::new()))
    }

    pub fn with_log_dir(log_config: LogManagerConfig) -> Self {
        Self::create(RecoveryConfig::default(), LogSource::File(log_config))
    }

    fn create(config: RecoveryConfig, log: LogSource) -> Self {
        let store = Arc::new(MemoryStore::default());
        store.alloc_part(DATA_PARTITION).unwrap();
        for index in 0..NUM_PAGES {
            store.alloc_page(page(index)).unwrap();
        }
        let db = Self::open(store, config, log);
        db.rm.initialize().unwrap();
        db
    }

    fn open(store: Arc<MemoryStore>, config: RecoveryConfig, log: LogSource) -> Self {
        let restored: Arc<Mutex<HashMap<TxnNum, Arc<TransactionContext>>>> = Arc::default();
        let trans_nums = Arc::new(TxnNumGenerator::new());
        let factory: TransactionFactory = {
            let restored = restored.clone();
            let trans_nums = trans_nums.clone();
            Arc::new(move |trans_num: TxnNum| {
                trans_nums.update_if_greater(trans_num).unwrap();
                let transaction = Arc::new(TransactionContext::new(trans_num));
                restored.lock().insert(trans_num, transaction.clone());
                transaction as Arc<dyn Transaction>
            })
        };
        let rm = Arc::new(AriesRecoveryManager::new(
            config.clone(),
            store.clone(),
            store.clone(),
            log.open(),
            factory,
        ));
        let hooks: Weak<dyn FlushHooks> = Arc::downgrade(&rm) as Weak<dyn FlushHooks>;
        store.set_flush_hooks(hooks);
        Self {
            store,
            rm,
            config,
            log,
            restored,
            trans_nums,
        }
    }

    /// Lose the buffer pool and the unflushed log tail, then reopen without
    /// running restart.
    pub fn crash(self) -> Self {
        let Self {
            store,
            rm,
            config,
            log,
            ..
        } = self;
        store.crash();
        drop(rm);
        Self::open(store, config, log)
    }

    /// Crash and run restart recovery.
    pub fn crash_and_restart(self) -> Self {
        let db = self.crash();
        db.rm.restart().unwrap();
        db
    }

    /// Start a transaction with the next unused number.
    pub fn begin_next(&self) -> Arc<TransactionContext> {
        let trans_num = self.trans_nums.next().unwrap();
        self.begin(trans_num)
    }

    pub fn begin(&self, trans_num: TxnNum) -> Arc<TransactionContext> {
        self.trans_nums.update_if_greater(trans_num).unwrap();
        let transaction = Arc::new(TransactionContext::new(trans_num));
        self.rm.start_transaction(transaction.clone());
        transaction
    }

    /// Log and perform a write, the way an access method would.
    pub fn write(&self, trans_num: TxnNum, page: PageNum, offset: u16, bytes: &[u8]) -> Lsn {
        let mut handle = self.store.fetch_page(page).unwrap();
        let before = handle.read(usize::from(offset), bytes.len()).unwrap();
        let lsn = self
            .rm
            .log_page_write(trans_num, page, offset, &before, bytes)
            .unwrap();
        handle.write(usize::from(offset), bytes).unwrap();
        handle.set_page_lsn(lsn);
        lsn
    }

    pub fn read(&self, page: PageNum, offset: u16, len: usize) -> Vec<u8> {
        self.store
            .fetch_page(page)
            .unwrap()
            .read(usize::from(offset), len)
            .unwrap()
    }

    /// The handle restart created for `trans_num`, if it found the
    /// transaction in the log.
    pub fn restored(&self, trans_num: TxnNum) -> Option<Arc<TransactionContext>> {
        self.restored.lock().get(&trans_num).cloned()
    }

    /// Every record after the master record.
    pub fn records(&self) -> Vec<(Lsn, LogRecord)> {
        self.rm.log().scan_from(1).collect()
    }
}
