//! Packed thread identifiers
//!
//! A [`ThreadId`] names the host thread a callback should run on, together
//! with the queue on that thread and the task and thread priorities. It is
//! carried across the host boundary as a single integer code with a fixed
//! bit layout:
//!
//! | Field           | Bits  | Values                                        |
//! |-----------------|-------|-----------------------------------------------|
//! | Thread index    | 0-7   | 0 = RHI, 1 = game, 2 = rendering, 0xFF = any  |
//! | Queue index     | 8     | 0 = main, 1 = local                           |
//! | Task priority   | 9     | 0 = normal, 1 = high                          |
//! | Thread priority | 10-11 | 0 = normal, 1 = high, 2 = background          |

use std::fmt;
use crate::error::{Error, Result};

const THREAD_INDEX_MASK: u32 = 0xff;
const QUEUE_INDEX_MASK: u32 = 0x100;
const QUEUE_INDEX_SHIFT: u32 = 8;
const TASK_PRIORITY_MASK: u32 = 0x200;
const TASK_PRIORITY_SHIFT: u32 = 9;
const THREAD_PRIORITY_MASK: u32 = 0xc00;
const THREAD_PRIORITY_SHIFT: u32 = 10;
const VALID_BITS: u32 = THREAD_INDEX_MASK | QUEUE_INDEX_MASK | TASK_PRIORITY_MASK | THREAD_PRIORITY_MASK;

/// Index of a named host thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIndex(pub u8);

impl ThreadIndex {
    /// Render hardware interface thread
    pub const RHI: ThreadIndex = ThreadIndex(0);
    /// Primary game thread
    pub const GAME: ThreadIndex = ThreadIndex(1);
    /// Dedicated rendering thread (may alias the game thread on some hosts)
    pub const ACTUAL_RENDERING: ThreadIndex = ThreadIndex(2);
    /// Sentinel for "any unnamed thread" or "unknown thread"
    pub const ANY: ThreadIndex = ThreadIndex(0xff);

    /// Whether this is the any-thread sentinel
    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// Get the raw index
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ThreadIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RHI => write!(f, "RHIThread"),
            Self::GAME => write!(f, "GameThread"),
            Self::ACTUAL_RENDERING => write!(f, "ActualRenderingThread"),
            Self::ANY => write!(f, "AnyThread"),
            ThreadIndex(other) => write!(f, "NamedThread{}", other),
        }
    }
}

/// FIFO lane within a named thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueIndex {
    /// The thread's main queue
    #[default]
    Main = 0,
    /// The thread's local queue
    Local = 1,
}

/// Priority of an individual task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskPriority {
    /// Normal task priority
    #[default]
    Normal = 0,
    /// High task priority
    High = 1,
}

/// Priority of the thread a task may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadPriority {
    /// Normal-priority thread
    #[default]
    Normal = 0,
    /// High-priority thread
    High = 1,
    /// Background thread
    Background = 2,
}

/// A thread identifier: thread index, queue, task priority and thread priority
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    /// RHI thread, main queue
    pub const RHI_THREAD: ThreadId = pack(0, 0, 0, 0);
    /// Game thread, main queue
    pub const GAME_THREAD: ThreadId = pack(1, 0, 0, 0);
    /// Rendering thread, main queue
    pub const ACTUAL_RENDERING_THREAD: ThreadId = pack(2, 0, 0, 0);
    /// Any unnamed thread
    pub const ANY_THREAD: ThreadId = pack(0xff, 0, 0, 0);

    /// Game thread, local queue
    pub const GAME_THREAD_LOCAL: ThreadId = pack(1, 1, 0, 0);
    /// Rendering thread, local queue
    pub const ACTUAL_RENDERING_THREAD_LOCAL: ThreadId = pack(2, 1, 0, 0);

    /// Any high-priority thread, normal task
    pub const ANY_HI_PRI_THREAD_NORMAL_TASK: ThreadId = pack(0xff, 0, 0, 1);
    /// Any high-priority thread, high-priority task
    pub const ANY_HI_PRI_THREAD_HI_PRI_TASK: ThreadId = pack(0xff, 0, 1, 1);
    /// Any normal-priority thread, normal task
    pub const ANY_NORMAL_THREAD_NORMAL_TASK: ThreadId = pack(0xff, 0, 0, 0);
    /// Any normal-priority thread, high-priority task
    pub const ANY_NORMAL_THREAD_HI_PRI_TASK: ThreadId = pack(0xff, 0, 1, 0);
    /// Any background thread, normal task
    pub const ANY_BACKGROUND_THREAD_NORMAL_TASK: ThreadId = pack(0xff, 0, 0, 2);
    /// Any background thread, high-priority task
    pub const ANY_BACKGROUND_HI_PRI_TASK: ThreadId = pack(0xff, 0, 1, 2);

    /// Main-queue, normal-priority identifier for a named thread
    pub fn named(thread: ThreadIndex) -> Self {
        pack(thread.0 as u32, 0, 0, 0)
    }

    /// Decode a host thread code
    pub fn from_code(code: i32) -> Result<Self> {
        decompose(code).map(|(thread, queue, task, priority)| {
            pack(thread.0 as u32, queue as u32, task as u32, priority as u32)
        })
    }

    /// The integer code handed to the host
    pub fn code(self) -> i32 {
        self.0 as i32
    }

    /// Which named thread this targets
    pub fn thread_index(self) -> ThreadIndex {
        ThreadIndex((self.0 & THREAD_INDEX_MASK) as u8)
    }

    /// Which queue on the thread this targets
    pub fn queue_index(self) -> QueueIndex {
        if self.0 & QUEUE_INDEX_MASK != 0 {
            QueueIndex::Local
        } else {
            QueueIndex::Main
        }
    }

    /// Task priority
    pub fn task_priority(self) -> TaskPriority {
        if self.0 & TASK_PRIORITY_MASK != 0 {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        }
    }

    /// Thread priority
    pub fn thread_priority(self) -> ThreadPriority {
        // Constructors reject priority 3, so anything else is background
        match (self.0 & THREAD_PRIORITY_MASK) >> THREAD_PRIORITY_SHIFT {
            0 => ThreadPriority::Normal,
            1 => ThreadPriority::High,
            _ => ThreadPriority::Background,
        }
    }

    /// Whether this targets the any-thread sentinel
    pub fn is_any_thread(self) -> bool {
        self.thread_index().is_any()
    }

    /// Whether both identifiers name the same thread.
    ///
    /// Queue and priorities are ignored. The any-thread sentinel matches
    /// itself, since a host reports every unnamed thread as the sentinel.
    pub fn same_named_thread(self, other: ThreadId) -> bool {
        self.thread_index() == other.thread_index()
    }

    /// Copy of this identifier targeting a different queue
    pub fn with_queue(self, queue: QueueIndex) -> Result<Self> {
        compose(self.thread_index(), queue, self.task_priority(), self.thread_priority())
    }

    /// Copy of this identifier with a different task priority
    pub fn with_task_priority(self, task: TaskPriority) -> Self {
        pack(
            self.thread_index().0 as u32,
            self.queue_index() as u32,
            task as u32,
            self.thread_priority() as u32,
        )
    }

    /// Copy of this identifier with a different thread priority
    pub fn with_thread_priority(self, priority: ThreadPriority) -> Self {
        pack(
            self.thread_index().0 as u32,
            self.queue_index() as u32,
            self.task_priority() as u32,
            priority as u32,
        )
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::GAME_THREAD
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadId")
            .field("code", &format_args!("{:#05x}", self.0))
            .field("thread", &self.thread_index())
            .field("queue", &self.queue_index())
            .field("task_priority", &self.task_priority())
            .field("thread_priority", &self.thread_priority())
            .finish()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.thread_index())?;
        if self.queue_index() == QueueIndex::Local {
            write!(f, "_Local")?;
        }
        if self.task_priority() == TaskPriority::High {
            write!(f, "+HiPriTask")?;
        }
        match self.thread_priority() {
            ThreadPriority::Normal => Ok(()),
            ThreadPriority::High => write!(f, "+HiPriThread"),
            ThreadPriority::Background => write!(f, "+Background"),
        }
    }
}

impl TryFrom<i32> for ThreadId {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Self::from_code(code)
    }
}

impl From<ThreadId> for i32 {
    fn from(id: ThreadId) -> i32 {
        id.code()
    }
}

const fn pack(thread: u32, queue: u32, task: u32, priority: u32) -> ThreadId {
    ThreadId(
        thread
            | (queue << QUEUE_INDEX_SHIFT)
            | (task << TASK_PRIORITY_SHIFT)
            | (priority << THREAD_PRIORITY_SHIFT),
    )
}

fn invalid(reason: String) -> Error {
    Error::InvalidThreadEncoding { reason }
}

/// Combine the four fields into a thread identifier.
///
/// Fails if the any-thread sentinel is paired with the local queue.
pub fn compose(
    thread: ThreadIndex,
    queue: QueueIndex,
    task: TaskPriority,
    priority: ThreadPriority,
) -> Result<ThreadId> {
    if thread.is_any() && queue == QueueIndex::Local {
        return Err(invalid(
            "the any-thread sentinel cannot target a local queue".to_string(),
        ));
    }
    Ok(pack(thread.0 as u32, queue as u32, task as u32, priority as u32))
}

/// Combine untyped fields, checking each against its bit width
pub fn compose_raw(thread: u32, queue: u32, task: u32, priority: u32) -> Result<ThreadId> {
    if thread > THREAD_INDEX_MASK {
        return Err(invalid(format!("thread index {} does not fit in 8 bits", thread)));
    }
    let queue = match queue {
        0 => QueueIndex::Main,
        1 => QueueIndex::Local,
        other => return Err(invalid(format!("queue index {} out of range", other))),
    };
    let task = match task {
        0 => TaskPriority::Normal,
        1 => TaskPriority::High,
        other => return Err(invalid(format!("task priority {} out of range", other))),
    };
    let priority = match priority {
        0 => ThreadPriority::Normal,
        1 => ThreadPriority::High,
        2 => ThreadPriority::Background,
        other => return Err(invalid(format!("thread priority {} out of range", other))),
    };
    compose(ThreadIndex(thread as u8), queue, task, priority)
}

/// Split a host thread code into its four fields
pub fn decompose(code: i32) -> Result<(ThreadIndex, QueueIndex, TaskPriority, ThreadPriority)> {
    if code < 0 {
        return Err(invalid(format!("negative thread code {}", code)));
    }
    let raw = code as u32;
    if raw & !VALID_BITS != 0 {
        return Err(invalid(format!("thread code {:#x} has bits above bit 11 set", raw)));
    }
    compose_raw(
        raw & THREAD_INDEX_MASK,
        (raw & QUEUE_INDEX_MASK) >> QUEUE_INDEX_SHIFT,
        (raw & TASK_PRIORITY_MASK) >> TASK_PRIORITY_SHIFT,
        (raw & THREAD_PRIORITY_MASK) >> THREAD_PRIORITY_SHIFT,
    )
    .map(|id| (id.thread_index(), id.queue_index(), id.task_priority(), id.thread_priority()))
}
