//! Module closures exposed to the host.
//!
//! A module callback is a function table index plus a pointer to its
//! captured environment in linear memory. The host gets a [`Closure`]
//! wrapper it can call any number of times. The wrapper carries a live
//! count: one for the owner, plus one for every call frame currently inside
//! it. The module's destructor for the environment runs exactly once, when
//! the count reaches zero, so a closure released from inside its own call
//! is only torn down after that call unwinds.

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::Cell;
use core::fmt;

use crate::abi;
use crate::bridge::Bridge;
use crate::module::TableEntry;
use crate::value::HostValue;
use crate::{BridgeError, BridgeResult};

/// Captured environment of a module closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureEnv {
    /// Pointer to the captured state in linear memory.
    pub state: u32,
    /// Function table index of the closure body.
    pub index: u32,
}

/// Calling convention of a closure body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// No arguments.
    Nullary,
    /// One argument.
    Unary,
    /// Two arguments.
    Binary,
}

impl Signature {
    /// Number of arguments.
    pub fn arity(self) -> usize {
        match self {
            Signature::Nullary => 0,
            Signature::Unary => 1,
            Signature::Binary => 2,
        }
    }
}

bitflags::bitflags! {
    /// Closure lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClosureFlags: u8 {
        /// The owner gave up its reference.
        const RELEASED = 1 << 0;
        /// The destructor ran.
        const DESTROYED = 1 << 1;
    }
}

/// State shared by every clone of a wrapper and the finalization registry.
pub(crate) struct ClosureState {
    env: Cell<ClosureEnv>,
    live: Cell<u32>,
    dtor: u32,
    signature: Signature,
    flags: Cell<ClosureFlags>,
}

impl ClosureState {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.flags.get().contains(ClosureFlags::DESTROYED)
    }

    fn set_flag(&self, flag: ClosureFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    fn enter(&self) {
        self.live.set(self.live.get() + 1);
    }

    fn leave(&self, bridge: &mut Bridge) {
        let live = self.live.get().saturating_sub(1);
        self.live.set(live);
        if live == 0 {
            self.destroy(bridge);
        }
    }

    /// Run the module destructor. Idempotent.
    pub(crate) fn destroy(&self, bridge: &mut Bridge) {
        if self.is_destroyed() {
            return;
        }
        self.set_flag(ClosureFlags::DESTROYED);
        let env = self.env.get();
        match bridge.runtime.function(self.dtor) {
            Some(TableEntry::Destructor(dtor)) => dtor(bridge, env),
            other => log::warn!(
                "closure destructor {} is not callable: {:?}",
                self.dtor,
                other
            ),
        }
        self.env.set(ClosureEnv { state: 0, ..env });
        log::trace!("closure {} destroyed", env.index);
    }

    /// Arguments are lowered only once the table entry matches, so a
    /// mismatch leaves the extern table untouched.
    fn dispatch(&self, bridge: &mut Bridge, env: ClosureEnv, args: &[HostValue]) -> BridgeResult<()> {
        let entry = bridge
            .runtime
            .function(env.index)
            .ok_or(BridgeError::MissingFunction(env.index))?;
        match (self.signature, entry, args) {
            (Signature::Nullary, TableEntry::Nullary(f), []) => f(bridge, env.state),
            (Signature::Unary, TableEntry::Unary(f), [a]) => {
                let a = abi::lower(a.clone(), &mut bridge.externs);
                f(bridge, env.state, a)
            }
            (Signature::Binary, TableEntry::Binary(f), [a, b]) => {
                let a = abi::lower(a.clone(), &mut bridge.externs);
                let b = abi::lower(b.clone(), &mut bridge.externs);
                f(bridge, env.state, a, b)
            }
            (signature, entry, _) => Err(BridgeError::SignatureMismatch {
                expected: signature.arity(),
                actual: entry.arity().unwrap_or(0),
            }),
        }
    }
}

pub(crate) struct ClosureInner {
    pub(crate) state: Rc<ClosureState>,
}

/// Host-side handle on a module closure.
///
/// Clones share one live count; dropping clones does not release the
/// closure. Call [`release`](Self::release) once when the owner is done.
#[derive(Clone)]
pub struct Closure {
    pub(crate) inner: Rc<ClosureInner>,
}

impl Closure {
    /// Invoke the closure body with `args`.
    ///
    /// Fails with [`BridgeError::ClosureDestroyed`] once the closure has been
    /// released, even while an earlier call is still on the stack.
    pub fn call(&self, bridge: &mut Bridge, args: &[HostValue]) -> BridgeResult<()> {
        let state = &self.inner.state;
        if state
            .flags
            .get()
            .intersects(ClosureFlags::RELEASED | ClosureFlags::DESTROYED)
        {
            return Err(BridgeError::ClosureDestroyed);
        }
        let expected = state.signature.arity();
        if args.len() != expected {
            return Err(BridgeError::SignatureMismatch {
                expected,
                actual: args.len(),
            });
        }

        // Keep the wrapper alive for the whole frame, even if every other
        // clone is dropped while the body runs.
        let frame = self.clone();
        let state = &frame.inner.state;
        state.enter();

        let env = state.env.get();
        state.env.set(ClosureEnv { state: 0, ..env });
        let result = state.dispatch(bridge, env, args);
        state.env.set(env);
        state.leave(bridge);

        if let Err(err) = &result {
            log::debug!("closure {} failed: {}", env.index, err);
        }
        result
    }

    /// Give up the owner's reference.
    ///
    /// Returns whether this destroyed the closure. Releasing twice, or after
    /// destruction, does nothing.
    pub fn release(&self, bridge: &mut Bridge) -> bool {
        let state = &self.inner.state;
        if state.is_destroyed() || state.flags.get().contains(ClosureFlags::RELEASED) {
            log::warn!("closure {} released twice", state.env.get().index);
            return false;
        }
        state.set_flag(ClosureFlags::RELEASED);
        state.leave(bridge);
        state.is_destroyed()
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Closure) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the destructor has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.is_destroyed()
    }

    /// Owner reference plus active call frames.
    pub fn live_count(&self) -> u32 {
        self.inner.state.live.get()
    }

    /// Current captured environment. `state` reads 0 while a call is active.
    pub fn env(&self) -> ClosureEnv {
        self.inner.state.env.get()
    }

    /// Calling convention.
    pub fn signature(&self) -> Signature {
        self.inner.state.signature
    }

    /// Lifecycle flags.
    pub fn flags(&self) -> ClosureFlags {
        self.inner.state.flags.get()
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env = self.env();
        f.debug_struct("Closure")
            .field("index", &env.index)
            .field("live", &self.live_count())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Bridge {
    /// Wrap a module closure for the host.
    ///
    /// `dtor` must name a destructor entry in the function table. The
    /// returned wrapper starts with one live reference, owned by the caller.
    pub fn wrap_closure(
        &mut self,
        env: ClosureEnv,
        dtor: u32,
        signature: Signature,
    ) -> BridgeResult<Closure> {
        match self.runtime.function(dtor) {
            Some(TableEntry::Destructor(_)) => {}
            Some(_) => {
                return Err(BridgeError::TypeMismatch(String::from(
                    "closure destructor is not a destructor entry",
                )))
            }
            None => return Err(BridgeError::MissingFunction(dtor)),
        }

        let state = Rc::new(ClosureState {
            env: Cell::new(env),
            live: Cell::new(1),
            dtor,
            signature,
            flags: Cell::new(ClosureFlags::empty()),
        });
        let closure = Closure {
            inner: Rc::new(ClosureInner { state }),
        };
        log::trace!("closure {} wrapped ({:?})", env.index, signature);

        if self.finalizers.register(&closure) {
            self.collect_garbage();
        }
        Ok(closure)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::abi::CoreValue;
    use crate::externref::Handle;
    use crate::module::BumpModule;
    use crate::BridgeConfig;

    // Layout of the captured state used by these callbacks.
    pub(crate) const CALLS: u32 = 0;
    const SUM: u32 = 16;
    pub(crate) const DTOR_COUNT: u32 = 1024;

    // Fixed addresses for the reentrant callback, which cannot rely on its
    // state pointer once a frame is active.
    const DEPTH: u32 = 2048;
    const SELF_HANDLE: u32 = 2052;
    const DTORS_SEEN: u32 = 2056;
    const ENV_SEEN: u32 = 2060;
    const STATE_ARGS: u32 = 2064;
    const BODY_RUNS: u32 = 2080;
    const REJECTED: u32 = 2084;
    const DTORS_IN_FRAME: u32 = 2088;

    fn bump(bridge: &mut Bridge, state: u32, offset: u32) -> BridgeResult<()> {
        let data = bridge.data();
        let v = data.get_u32(state + offset)?;
        data.set_u32(state + offset, v + 1)
    }

    pub(crate) fn count_calls(bridge: &mut Bridge, state: u32) -> BridgeResult<()> {
        bump(bridge, state, CALLS)
    }

    fn add(bridge: &mut Bridge, state: u32, a: CoreValue, b: CoreValue) -> BridgeResult<()> {
        let a = a.as_f64().unwrap_or(0.0);
        let b = b.as_f64().unwrap_or(0.0);
        bridge.data().set_f64(state + SUM, a + b)
    }

    fn trap(bridge: &mut Bridge, state: u32) -> BridgeResult<()> {
        bump(bridge, state, CALLS)?;
        Err(BridgeError::Trap(String::from("unreachable")))
    }

    fn self_closure(bridge: &mut Bridge) -> BridgeResult<Closure> {
        let handle = Handle::from_u32(bridge.data().get_u32(SELF_HANDLE)?);
        bridge
            .externs()
            .resolve(handle)?
            .as_closure()
            .cloned()
            .ok_or(BridgeError::TypeMismatch(String::from("not a closure")))
    }

    fn reentrant(bridge: &mut Bridge, state: u32) -> BridgeResult<()> {
        let depth = bridge.data().get_u32(DEPTH)?;
        bridge.data().set_u32(DEPTH, depth + 1)?;
        bridge.data().set_u32(STATE_ARGS + 4 * depth, state)?;
        let closure = self_closure(bridge)?;

        if depth == 0 {
            bridge.data().set_u32(ENV_SEEN, closure.env().state)?;
            closure.call(bridge, &[])?;
            closure.release(bridge);
            let seen = bridge.data().get_u32(DTOR_COUNT)?;
            bridge.data().set_u32(DTORS_SEEN, seen)?;
        }
        Ok(())
    }

    // Releases its own wrapper, then tries to call it again.
    fn release_then_call(bridge: &mut Bridge, _state: u32) -> BridgeResult<()> {
        bump(bridge, BODY_RUNS, 0)?;
        let closure = self_closure(bridge)?;
        closure.release(bridge);
        let rejected = closure.call(bridge, &[]) == Err(BridgeError::ClosureDestroyed);
        bridge.data().set_u32(REJECTED, rejected as u32)?;
        let dtors = bridge.data().get_u32(DTOR_COUNT)?;
        bridge.data().set_u32(DTORS_IN_FRAME, dtors)
    }

    pub(crate) fn dtor(bridge: &mut Bridge, _env: ClosureEnv) {
        let _ = bump(bridge, DTOR_COUNT, 0);
    }

    pub(crate) struct Fixture {
        pub(crate) bridge: Bridge,
        pub(crate) dtor: u32,
        pub(crate) count_calls: u32,
        add: u32,
        trap: u32,
        reentrant: u32,
        release_then_call: u32,
    }

    pub(crate) fn fixture(config: BridgeConfig) -> Fixture {
        let mut module = BumpModule::new(1).unwrap();
        let dtor = module.add_function(TableEntry::Destructor(dtor));
        let count_calls = module.add_function(TableEntry::Nullary(count_calls));
        let add = module.add_function(TableEntry::Binary(add));
        let trap = module.add_function(TableEntry::Nullary(trap));
        let reentrant = module.add_function(TableEntry::Nullary(reentrant));
        let release_then_call = module.add_function(TableEntry::Nullary(release_then_call));
        Fixture {
            bridge: Bridge::new(module, config),
            dtor,
            count_calls,
            add,
            trap,
            reentrant,
            release_then_call,
        }
    }

    pub(crate) fn env_at(bridge: &mut Bridge, index: u32) -> ClosureEnv {
        let state = bridge.runtime_mut().malloc(32, 4).unwrap();
        ClosureEnv { state, index }
    }

    fn read(bridge: &mut Bridge, addr: u32) -> u32 {
        bridge.data().get_u32(addr).unwrap()
    }

    #[test]
    fn call_many_times_then_release() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.count_calls);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();
        for _ in 0..3 {
            c.call(&mut fx.bridge, &[]).unwrap();
        }
        assert_eq!(read(&mut fx.bridge, env.state + CALLS), 3);
        assert_eq!(c.live_count(), 1);
        assert_eq!(c.env(), env);

        assert!(c.release(&mut fx.bridge));
        assert_eq!(read(&mut fx.bridge, DTOR_COUNT), 1);
        assert_eq!(c.call(&mut fx.bridge, &[]), Err(BridgeError::ClosureDestroyed));
        assert_eq!(read(&mut fx.bridge, env.state + CALLS), 3);
    }

    #[test]
    fn release_mid_call_defers_destructor() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.reentrant);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();
        let handle = fx.bridge.externs_mut().alloc(HostValue::Closure(c.clone()));
        fx.bridge.data().set_u32(SELF_HANDLE, handle.as_u32()).unwrap();

        c.call(&mut fx.bridge, &[]).unwrap();

        // Outer frame plus one recursive frame.
        assert_eq!(read(&mut fx.bridge, DEPTH), 2);
        // Released inside the outer frame, but the destructor waited for it.
        assert_eq!(read(&mut fx.bridge, DTORS_SEEN), 0);
        assert_eq!(read(&mut fx.bridge, DTOR_COUNT), 1);
        // The shared state pointer reads 0 while a frame is active, so the
        // outer frame gets the real pointer and the nested one gets 0.
        assert_eq!(read(&mut fx.bridge, ENV_SEEN), 0);
        assert_eq!(read(&mut fx.bridge, STATE_ARGS), env.state);
        assert_eq!(read(&mut fx.bridge, STATE_ARGS + 4), 0);

        assert!(c.is_destroyed());
        assert_eq!(c.live_count(), 0);
        assert!(!c.release(&mut fx.bridge));
        assert_eq!(read(&mut fx.bridge, DTOR_COUNT), 1);
    }

    #[test]
    fn released_closure_rejects_calls_from_active_frame() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.release_then_call);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();
        let handle = fx.bridge.externs_mut().alloc(HostValue::Closure(c.clone()));
        fx.bridge.data().set_u32(SELF_HANDLE, handle.as_u32()).unwrap();

        c.call(&mut fx.bridge, &[]).unwrap();

        assert_eq!(read(&mut fx.bridge, BODY_RUNS), 1);
        assert_eq!(read(&mut fx.bridge, REJECTED), 1);
        assert_eq!(read(&mut fx.bridge, DTORS_IN_FRAME), 0);
        assert_eq!(read(&mut fx.bridge, DTOR_COUNT), 1);
        assert!(c.is_destroyed());
    }

    #[test]
    fn released_clone_rejects_calls() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.count_calls);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();
        let kept = c.clone();
        assert!(c.release(&mut fx.bridge));
        assert_eq!(kept.call(&mut fx.bridge, &[]), Err(BridgeError::ClosureDestroyed));
        assert_eq!(read(&mut fx.bridge, env.state + CALLS), 0);
    }

    #[test]
    fn trap_restores_state_and_unrefs() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.trap);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();

        let err = c.call(&mut fx.bridge, &[]).unwrap_err();
        assert!(matches!(err, BridgeError::Trap(_)));
        assert_eq!(c.live_count(), 1);
        assert_eq!(c.env().state, env.state);
        assert!(!c.is_destroyed());

        // Still callable after a trap.
        assert!(c.call(&mut fx.bridge, &[]).is_err());
        assert_eq!(read(&mut fx.bridge, env.state + CALLS), 2);
        assert!(c.release(&mut fx.bridge));
    }

    #[test]
    fn binary_arguments_lowered() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.add);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Binary).unwrap();
        c.call(&mut fx.bridge, &[HostValue::Number(1.5), HostValue::Number(2.0)])
            .unwrap();
        assert_eq!(fx.bridge.data().get_f64(env.state + SUM).unwrap(), 3.5);
    }

    #[test]
    fn arity_checked() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.add);
        let c = fx.bridge.wrap_closure(env, fx.dtor, Signature::Binary).unwrap();
        assert_eq!(
            c.call(&mut fx.bridge, &[HostValue::Null]),
            Err(BridgeError::SignatureMismatch { expected: 2, actual: 1 })
        );

        // Declared unary, but the table entry is binary.
        let wrong = fx.bridge.wrap_closure(env, fx.dtor, Signature::Unary).unwrap();
        assert_eq!(
            wrong.call(&mut fx.bridge, &[HostValue::Null]),
            Err(BridgeError::SignatureMismatch { expected: 1, actual: 2 })
        );
        assert_eq!(wrong.live_count(), 1);

        // Arguments are not lowered into the table when dispatch fails.
        let before = fx.bridge.externs().len();
        assert!(wrong.call(&mut fx.bridge, &[HostValue::string("x")]).is_err());
        let missing = fx
            .bridge
            .wrap_closure(ClosureEnv { index: 99, ..env }, fx.dtor, Signature::Unary)
            .unwrap();
        assert_eq!(
            missing.call(&mut fx.bridge, &[HostValue::string("y")]),
            Err(BridgeError::MissingFunction(99))
        );
        assert_eq!(fx.bridge.externs().len(), before);
    }

    #[test]
    fn destructor_must_be_destructor_entry() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.count_calls);
        assert!(fx
            .bridge
            .wrap_closure(env, fx.count_calls, Signature::Nullary)
            .is_err());
        assert_eq!(
            fx.bridge.wrap_closure(env, 99, Signature::Nullary).unwrap_err(),
            BridgeError::MissingFunction(99)
        );
    }

    #[test]
    fn clones_share_identity() {
        let mut fx = fixture(BridgeConfig::default());
        let env = env_at(&mut fx.bridge, fx.count_calls);
        let a = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();
        let b = fx.bridge.wrap_closure(env, fx.dtor, Signature::Nullary).unwrap();
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert_eq!(HostValue::Closure(a.clone()), HostValue::Closure(a));
    }
}
