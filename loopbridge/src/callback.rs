//! Typed handles to foreign callback slots.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::bridge::abi::ForeignRuntime;
use crate::bridge::capsule::{self, BindingCapsule, Capsule, RawBinding};
use crate::error::BridgeError;
use crate::executor::Executor;
use crate::thread;

/// A foreign callback taking `&Arg` and returning `Ret`.
///
/// The foreign side owns the slot and the installed handler; the handle
/// drops the slot when it goes away. Loop thread only, except for dropping.
pub struct Callback<Arg, Ret> {
    id: usize,
    runtime: Arc<dyn ForeignRuntime>,
    _signature: PhantomData<fn(&Arg) -> Ret>,
}

impl<Arg: 'static, Ret: 'static> Callback<Arg, Ret> {
    pub fn new(executor: &Executor) -> Result<Self, BridgeError> {
        thread::assert_loop_thread("Callback::new");
        let runtime = Arc::clone(executor.runtime());
        let id = runtime.callback_new();
        if id == 0 {
            tracing::warn!("foreign runtime refused to allocate a callback");
            return Err(BridgeError::ResourceUnavailable("callback"));
        }
        tracing::debug!("callback {id} created");
        Ok(Self {
            id,
            runtime,
            _signature: PhantomData,
        })
    }

    /// Create a callback with its handler already installed.
    pub fn with_handler<F>(executor: &Executor, handler: F) -> Result<Self, BridgeError>
    where
        F: FnMut(&Arg) -> Ret + Send + 'static,
    {
        let callback = Self::new(executor)?;
        callback.set_handler(handler);
        Ok(callback)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Install `handler`, replacing (and releasing) any previous one.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(&Arg) -> Ret + Send + 'static,
    {
        thread::assert_loop_thread("Callback::set_handler");
        let RawBinding {
            binding,
            user_data,
            release,
        } = BindingCapsule::new(handler).into_raw();
        unsafe {
            self.runtime
                .callback_set_handler(self.id, binding, user_data, release)
        };
    }

    /// Invoke the callback. Without a handler the result is `Ret::default()`.
    pub fn call(&self, arg: &Arg) -> Ret
    where
        Ret: Default,
    {
        thread::assert_loop_thread("Callback::call");
        let mut ret = Ret::default();
        unsafe {
            self.runtime.callback_call(
                self.id,
                (arg as *const Arg).cast(),
                (&mut ret as *mut Ret).cast(),
            )
        };
        ret
    }
}

impl<Arg, Ret> Drop for Callback<Arg, Ret> {
    fn drop(&mut self) {
        let id = self.id;
        if thread::is_loop_thread() {
            self.runtime.callback_drop(id);
        } else {
            let runtime = Arc::clone(&self.runtime);
            capsule::post(
                self.runtime.as_ref(),
                Capsule::once(move || runtime.callback_drop(id)),
            );
        }
        tracing::debug!("callback {id} dropped");
    }
}
