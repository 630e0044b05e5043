//! Result codes and the error types of kernel operations
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use duet_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that kernel operations can
    /// produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// A parameter is out of range or misaligned.
        BadParam = -17,
        /// The current context disallows the operation.
        BadContext = -25,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur.
        WouldDeadlock = -30,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// An item couldn't be enqueued because the queue is full.
        QueueOverflow = -43,
        /// The wait operation was canceled.
        Interrupted = -49,
        /// A polling operation failed because the resource is not available.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Same discriminants as `ResultCode`
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: Both types are `repr(i8)`, and every discriminant
                //         of `$name` is a discriminant of `ResultCode`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod prepare_thread_error {}
    /// Error type for [`Thread::prepare`].
    ///
    /// [`Thread::prepare`]: crate::Thread::prepare
    pub enum PrepareThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range, or the stack top is misaligned.
        BadParam,
        /// The thread is neither uninitialized nor finished.
        BadObjectState,
    }
}

define_error! {
    mod start_thread_error {}
    /// Error type for [`Thread::start`].
    ///
    /// [`Thread::start`]: crate::Thread::start
    pub enum StartThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread is uninitialized or finished.
        BadObjectState,
    }
}

define_error! {
    mod pause_thread_error {}
    /// Error type for [`Thread::pause`].
    ///
    /// [`Thread::pause`]: crate::Thread::pause
    pub enum PauseThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread is uninitialized or finished.
        BadObjectState,
    }
}

define_error! {
    mod set_thread_priority_error {}
    /// Error type for [`Thread::set_priority`].
    ///
    /// [`Thread::set_priority`]: crate::Thread::set_priority
    pub enum SetThreadPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range.
        BadParam,
        /// The thread is uninitialized or finished.
        BadObjectState,
    }
}

define_error! {
    mod get_thread_priority_error {}
    /// Error type for [`Thread::priority`] and
    /// [`Thread::effective_priority`].
    ///
    /// [`Thread::priority`]: crate::Thread::priority
    /// [`Thread::effective_priority`]: crate::Thread::effective_priority
    pub enum GetThreadPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// The thread is uninitialized or finished.
        BadObjectState,
    }
}

define_error! {
    mod query_thread_error {}
    /// Error type for [`Thread::status`].
    ///
    /// [`Thread::status`]: crate::Thread::status
    pub enum QueryThreadError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod get_current_thread_error {}
    /// Error type for [`System::current_thread`].
    ///
    /// [`System::current_thread`]: crate::System::current_thread
    pub enum GetCurrentThreadError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`System::yield_now`].
    ///
    /// [`System::yield_now`]: crate::System::yield_now
    pub enum YieldError {
        /// CPU Lock is active, or the current context is not a thread context
        /// outside an interrupt handler.
        BadContext,
    }
}

define_error! {
    mod join_thread_error {}
    /// Error type for [`Thread::join`].
    ///
    /// [`Thread::join`]: crate::Thread::join
    pub enum JoinThreadError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The thread is uninitialized.
        BadObjectState,
        /// The thread tried to join itself.
        WouldDeadlock,
        /// The wait was canceled.
        Interrupted,
    }
}

define_error! {
    mod exit_thread_error {}
    /// Error type for [`System::exit_thread`].
    ///
    /// [`System::exit_thread`]: crate::System::exit_thread
    pub enum ExitThreadError {
        /// The current context is not a thread context, or is an interrupt
        /// context.
        BadContext,
    }
}

define_error! {
    mod cancel_wait_error {}
    /// Error type for [`Thread::cancel_wait`] and [`WaitQueue::cancel`].
    ///
    /// [`Thread::cancel_wait`]: crate::Thread::cancel_wait
    /// [`WaitQueue::cancel`]: crate::WaitQueue::cancel
    pub enum CancelWaitError {
        /// CPU Lock is active.
        BadContext,
        /// The thread is not waiting (in the specified queue).
        BadObjectState,
    }
}

define_error! {
    mod block_error {}
    /// Error type for [`WaitQueue::block`].
    ///
    /// [`WaitQueue::block`]: crate::WaitQueue::block
    pub enum BlockError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    mod unblock_error {}
    /// Error type for the unblock operations of [`WaitQueue`] and for
    /// [`CondVar::signal`].
    ///
    /// [`WaitQueue`]: crate::WaitQueue
    /// [`CondVar::signal`]: crate::CondVar::signal
    pub enum UnblockError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Mutex::lock`].
    ///
    /// [`Mutex::lock`]: crate::Mutex::lock
    pub enum LockMutexError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The current thread already owns the mutex.
        WouldDeadlock,
        /// The wait was canceled.
        Interrupted,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Mutex::try_lock`].
    ///
    /// [`Mutex::try_lock`]: crate::Mutex::try_lock
    pub enum TryLockMutexError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The current thread already owns the mutex.
        WouldDeadlock,
        /// The mutex is owned by another thread.
        Timeout,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for releasing a mutex.
    pub enum UnlockMutexError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The current thread does not own the mutex.
        NotOwner,
    }
}

define_error! {
    mod query_mutex_error {}
    /// Error type for [`Mutex::is_locked`].
    ///
    /// [`Mutex::is_locked`]: crate::Mutex::is_locked
    pub enum QueryMutexError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod wait_cond_var_error {}
    /// Error type for [`CondVar::wait`].
    ///
    /// [`CondVar::wait`]: crate::CondVar::wait
    pub enum WaitCondVarError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    mod send_mailbox_error {}
    /// Error type for [`Mailbox::try_send`].
    ///
    /// [`Mailbox::try_send`]: crate::Mailbox::try_send
    pub enum SendMailboxError {
        /// CPU Lock is active.
        BadContext,
        /// The mailbox is full.
        QueueOverflow,
    }
}

define_error! {
    mod recv_mailbox_error {}
    /// Error type for [`Mailbox::recv`].
    ///
    /// [`Mailbox::recv`]: crate::Mailbox::recv
    pub enum RecvMailboxError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The wait was canceled.
        Interrupted,
    }
}

define_error! {
    mod try_recv_mailbox_error {}
    /// Error type for [`Mailbox::try_recv`].
    ///
    /// [`Mailbox::try_recv`]: crate::Mailbox::try_recv
    pub enum TryRecvMailboxError {
        /// CPU Lock is active.
        BadContext,
        /// The mailbox is empty.
        Timeout,
    }
}

define_error! {
    mod irq_wait_error {}
    /// Error type for [`System::irq_wait`].
    ///
    /// [`System::irq_wait`]: crate::System::irq_wait
    pub enum IrqWaitError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The mask is empty.
        BadParam,
        /// The wait was canceled.
        Interrupted,
    }
}

define_error! {
    mod irq_config_error {}
    /// Error type for [`System::irq_set`], [`System::irq_enable`], and
    /// [`System::irq_disable`].
    ///
    /// [`System::irq_set`]: crate::System::irq_set
    /// [`System::irq_enable`]: crate::System::irq_enable
    /// [`System::irq_disable`]: crate::System::irq_disable
    pub enum IrqConfigError {
        /// CPU Lock is active.
        BadContext,
        /// The interrupt line is out of range.
        BadParam,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`System::sleep_ticks`] and [`System::timer_wait`].
    ///
    /// [`System::sleep_ticks`]: crate::System::sleep_ticks
    /// [`System::timer_wait`]: crate::System::timer_wait
    pub enum SleepError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The wait was canceled.
        Interrupted,
    }
}

define_error! {
    mod tick_task_error {}
    /// Error type for [`TickTask::start`] and [`TickTask::stop`].
    ///
    /// [`TickTask::start`]: crate::TickTask::start
    /// [`TickTask::stop`]: crate::TickTask::stop
    pub enum TickTaskError {
        /// CPU Lock is active.
        BadContext,
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(PrepareThreadError)]
    #[into(StartThreadError)]
    #[into(PauseThreadError)]
    #[into(SetThreadPriorityError)]
    #[into(GetThreadPriorityError)]
    #[into(QueryThreadError)]
    #[into(GetCurrentThreadError)]
    #[into(YieldError)]
    #[into(JoinThreadError)]
    #[into(ExitThreadError)]
    #[into(CancelWaitError)]
    #[into(BlockError)]
    #[into(UnblockError)]
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(QueryMutexError)]
    #[into(WaitCondVarError)]
    #[into(SendMailboxError)]
    #[into(RecvMailboxError)]
    #[into(TryRecvMailboxError)]
    #[into(IrqWaitError)]
    #[into(IrqConfigError)]
    #[into(SleepError)]
    #[into(TickTaskError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(PrepareThreadError)]
    #[into(SetThreadPriorityError)]
    #[into(IrqWaitError)]
    #[into(IrqConfigError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_suberror! {
    /// `BadObjectState`
    #[into(PrepareThreadError)]
    #[into(StartThreadError)]
    #[into(PauseThreadError)]
    #[into(SetThreadPriorityError)]
    #[into(GetThreadPriorityError)]
    #[into(JoinThreadError)]
    #[into(CancelWaitError)]
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

define_suberror! {
    /// Error codes shared by [`LockMutexError`] and [`TryLockMutexError`].
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    pub(crate) enum LockMutexPrecheckError {
        BadContext,
        WouldDeadlock,
    }
}

define_suberror! {
    /// `Interrupted`
    #[into(JoinThreadError)]
    #[into(LockMutexError)]
    #[into(RecvMailboxError)]
    #[into(IrqWaitError)]
    #[into(SleepError)]
    pub(crate) enum InterruptedError {
        Interrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_negative() {
        assert!(ResultCode::Success.is_ok());
        for code in [
            ResultCode::BadParam,
            ResultCode::BadContext,
            ResultCode::NotOwner,
            ResultCode::WouldDeadlock,
            ResultCode::BadObjectState,
            ResultCode::QueueOverflow,
            ResultCode::Interrupted,
            ResultCode::Timeout,
        ] {
            assert!(code.is_err(), "{code:?}");
        }
    }

    #[test]
    fn suberror_conversion() {
        assert_eq!(
            JoinThreadError::from(BadContextError::BadContext),
            JoinThreadError::BadContext
        );
        assert_eq!(
            LockMutexError::from(LockMutexPrecheckError::WouldDeadlock),
            LockMutexError::WouldDeadlock
        );
        assert_eq!(
            ResultCode::from(InterruptedError::Interrupted),
            ResultCode::Interrupted
        );
        assert_eq!(format!("{:?}", BadParamError::BadParam), "BadParam");
    }
}
