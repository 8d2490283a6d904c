// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred command buffer (§5/§4.7).
//!
//! Readers record structural edits into a [`CommandBuffer`] instead of
//! mutating the world directly; the single writer drains and replays
//! buffers it receives over a channel. Recorded `set` payloads live in a
//! bump arena owned by the buffer so replay needs no per-command heap
//! allocation. Entities created mid-buffer are referenced by a
//! [`Temp`] handle until commit, when they're resolved to the real
//! [`Id`] the writer actually allocated.

use std::cell::RefCell;

use bumpalo::Bump;
use crossbeam_channel::{Receiver, Sender};

use crate::error::{EcsError, Result};
use crate::id::Id;

/// A placeholder for an entity created earlier in the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temp(u32);

/// Either a real entity or a same-buffer temp handle, resolved to a real
/// [`Id`] at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Real(Id),
    Temp(Temp),
}

impl From<Id> for EntityRef {
    fn from(id: Id) -> Self {
        EntityRef::Real(id)
    }
}

impl From<Temp> for EntityRef {
    fn from(t: Temp) -> Self {
        EntityRef::Temp(t)
    }
}

struct SetPayload {
    component: Id,
    data: *mut u8,
    write: unsafe fn(*const u8, *mut u8),
    drop_fn: Option<unsafe fn(*mut u8)>,
}

// SAFETY: the arena-backed payload is only ever touched by the single
// writer that drains the buffer; it is never accessed concurrently.
unsafe impl Send for SetPayload {}

enum Command {
    Create { temp: Temp },
    Copy { temp: Temp, source: EntityRef },
    Add { target: EntityRef, component: Id },
    Remove { target: EntityRef, component: Id },
    Set { target: EntityRef, payload: SetPayload },
    Destroy { target: EntityRef },
}

/// A raw clone of a component's value, captured so a `Remove` (or the
/// implicit overwrite inside a `Set`) can be undone by replaying it as a
/// [`CommandSink::set_raw`] call. Sound because every [`crate::component::Component`]
/// is `Clone`, so `write` is never a bare byte copy of something with a
/// destructor.
pub struct ComponentSnapshot {
    component: Id,
    bytes: Vec<u8>,
    write: unsafe fn(*const u8, *mut u8),
}

impl ComponentSnapshot {
    pub fn new(component: Id, bytes: Vec<u8>, write: unsafe fn(*const u8, *mut u8)) -> Self {
        ComponentSnapshot { component, bytes, write }
    }
}

/// Receives the operations a [`CommandBuffer`] replays against a world.
/// Implemented by [`crate::world::World`]; kept as a trait so the buffer
/// itself doesn't need to know about world internals.
pub trait CommandSink {
    fn create(&mut self) -> Id;
    fn copy(&mut self, source: Id) -> Result<Id>;
    fn add(&mut self, target: Id, component: Id) -> Result<()>;
    fn remove(&mut self, target: Id, component: Id) -> Result<()>;
    /// `write` copies `size` bytes from `data` into the component's
    /// storage slot for `target`, initializing storage for `component`
    /// first if it isn't already present.
    unsafe fn set_raw(&mut self, target: Id, component: Id, data: *const u8, write: unsafe fn(*const u8, *mut u8)) -> Result<()>;
    fn destroy(&mut self, target: Id) -> Result<()>;

    /// Does `target` already carry `component`? Used to decide whether
    /// undoing an `Add`/`Set` should remove the component entirely or
    /// restore a snapshot of the value it had before (§5 atomicity).
    fn has(&self, target: Id, component: Id) -> bool;
    /// Is `target` a live entity at all? Used to validate a `Destroy`
    /// target before any destroy in the buffer is applied.
    fn exists(&self, target: Id) -> bool;
    /// Capture `target`'s current value for `component`, or `None` if it
    /// doesn't carry it. Used to build the undo for a `Remove`/`Set`.
    fn snapshot(&self, target: Id, component: Id) -> Option<ComponentSnapshot>;
    /// Would destroying `target` right now hit a cleanup cycle (§4.8)?
    /// A dry run: never mutates anything.
    fn would_cleanup_cycle(&self, target: Id) -> bool;
}

/// One step to reverse if a buffer's replay fails partway through,
/// applied in reverse order of how the forward commands ran (§5: "either
/// the whole buffer is applied, or none of it is observable").
enum Undo {
    /// Undoes a `Create`/`Copy`: the entity didn't exist before this
    /// buffer ran, so destroying it again is exact.
    Destroy(Id),
    /// Undoes an `Add`, or a `Set` that added the component as a side
    /// effect: the component wasn't there before, so removing it again
    /// is exact.
    Remove(Id, Id),
    /// Undoes a `Remove`, or a `Set` that overwrote an existing value:
    /// replay the snapshot taken just before the forward command ran.
    Restore(Id, ComponentSnapshot),
}

fn unwind(sink: &mut dyn CommandSink, undo: Vec<Undo>) {
    for action in undo.into_iter().rev() {
        match action {
            Undo::Destroy(id) => {
                let _ = sink.destroy(id);
            }
            Undo::Remove(target, component) => {
                let _ = sink.remove(target, component);
            }
            Undo::Restore(target, snapshot) => {
                let _ = unsafe { sink.set_raw(target, snapshot.component, snapshot.bytes.as_ptr(), snapshot.write) };
            }
        }
    }
}

/// Records structural edits for later, atomic replay.
pub struct CommandBuffer {
    bump: Bump,
    commands: Vec<Command>,
    next_temp: u32,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        CommandBuffer {
            bump: Bump::new(),
            commands: Vec::new(),
            next_temp: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn clear(&mut self) {
        for command in self.commands.drain(..) {
            if let Command::Set { payload, .. } = command {
                if let Some(drop_fn) = payload.drop_fn {
                    unsafe { drop_fn(payload.data) };
                }
            }
        }
        self.bump.reset();
        self.next_temp = 0;
    }

    /// Record the creation of a new entity, returning a handle usable by
    /// later commands in this same buffer.
    pub fn create(&mut self) -> Temp {
        let temp = Temp(self.next_temp);
        self.next_temp += 1;
        self.commands.push(Command::Create { temp });
        temp
    }

    /// Record a full copy of `source` (§4.7), returning a handle to the
    /// new entity.
    pub fn copy(&mut self, source: impl Into<EntityRef>) -> Temp {
        let temp = Temp(self.next_temp);
        self.next_temp += 1;
        self.commands.push(Command::Copy { temp, source: source.into() });
        temp
    }

    pub fn add(&mut self, target: impl Into<EntityRef>, component: Id) {
        self.commands.push(Command::Add { target: target.into(), component });
    }

    pub fn remove(&mut self, target: impl Into<EntityRef>, component: Id) {
        self.commands.push(Command::Remove { target: target.into(), component });
    }

    /// Record setting `component` on `target` to `value`, moving it into
    /// a bump-arena slot so replay doesn't need a fresh allocation.
    pub fn set<T: 'static>(
        &mut self,
        target: impl Into<EntityRef>,
        component: Id,
        value: T,
        drop_fn: Option<unsafe fn(*mut u8)>,
    ) {
        unsafe fn write_typed<T>(src: *const u8, dst: *mut u8) {
            let value = std::ptr::read(src as *const T);
            std::ptr::write(dst as *mut T, value);
        }
        let slot = self.bump.alloc(value) as *mut T as *mut u8;
        self.commands.push(Command::Set {
            target: target.into(),
            payload: SetPayload { component, data: slot, write: write_typed::<T>, drop_fn },
        });
    }

    pub fn destroy(&mut self, target: impl Into<EntityRef>) {
        self.commands.push(Command::Destroy { target: target.into() });
    }

    /// Replay every recorded command against `sink`. Either the whole
    /// buffer becomes observable or none of it does (§5): `Destroy`
    /// commands are deferred to a second phase and validated against
    /// `sink.exists`/`sink.would_cleanup_cycle` before any of them runs,
    /// and every other command is logged to an undo stack as it applies
    /// so a failure anywhere unwinds everything already committed. A
    /// buffer must not reference an entity it has already destroyed
    /// earlier in the same buffer — destroys never run until the end,
    /// so such a reference would observe the entity as still alive.
    pub fn apply(&mut self, sink: &mut dyn CommandSink) -> Result<()> {
        let mut resolved: Vec<Option<Id>> = vec![None; self.next_temp as usize];
        let resolve = |resolved: &[Option<Id>], r: EntityRef| -> Result<Id> {
            match r {
                EntityRef::Real(id) => Ok(id),
                EntityRef::Temp(Temp(idx)) => resolved[idx as usize]
                    .ok_or_else(|| EcsError::CommandBufferAborted("temp handle used before creation".into())),
            }
        };

        let mut undo: Vec<Undo> = Vec::new();
        let mut destroys: Vec<Id> = Vec::new();

        let phase_one = (|| -> Result<()> {
            for command in self.commands.drain(..) {
                match command {
                    Command::Create { temp } => {
                        let id = sink.create();
                        resolved[temp.0 as usize] = Some(id);
                        undo.push(Undo::Destroy(id));
                    }
                    Command::Copy { temp, source } => {
                        let source = resolve(&resolved, source)?;
                        let id = sink.copy(source)?;
                        resolved[temp.0 as usize] = Some(id);
                        undo.push(Undo::Destroy(id));
                    }
                    Command::Add { target, component } => {
                        let target = resolve(&resolved, target)?;
                        let already_present = sink.has(target, component);
                        sink.add(target, component)?;
                        if !already_present {
                            undo.push(Undo::Remove(target, component));
                        }
                    }
                    Command::Remove { target, component } => {
                        let target = resolve(&resolved, target)?;
                        let snapshot = sink.snapshot(target, component);
                        sink.remove(target, component)?;
                        if let Some(snapshot) = snapshot {
                            undo.push(Undo::Restore(target, snapshot));
                        }
                    }
                    Command::Set { target, payload } => {
                        let target = resolve(&resolved, target)?;
                        let prior = sink.snapshot(target, payload.component);
                        let result = unsafe { sink.set_raw(target, payload.component, payload.data, payload.write) };
                        if let Some(drop_fn) = payload.drop_fn {
                            unsafe { drop_fn(payload.data) };
                        }
                        result?;
                        match prior {
                            Some(snapshot) => undo.push(Undo::Restore(target, snapshot)),
                            None => undo.push(Undo::Remove(target, payload.component)),
                        }
                    }
                    Command::Destroy { target } => {
                        let target = resolve(&resolved, target)?;
                        destroys.push(target);
                    }
                }
            }
            Ok(())
        })();

        if let Err(err) = phase_one {
            unwind(sink, undo);
            self.bump.reset();
            self.next_temp = 0;
            return Err(err);
        }

        for &target in &destroys {
            if !sink.exists(target) {
                unwind(sink, undo);
                self.bump.reset();
                self.next_temp = 0;
                return Err(EcsError::InvalidEntity);
            }
            if sink.would_cleanup_cycle(target) {
                unwind(sink, undo);
                self.bump.reset();
                self.next_temp = 0;
                return Err(EcsError::CleanupCycle);
            }
        }

        for target in destroys {
            if sink.exists(target) {
                sink.destroy(target)?;
            }
        }

        self.bump.reset();
        self.next_temp = 0;
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Thread-local submission channel: readers push finished buffers here,
/// the writer drains and applies them (§5).
pub struct CommandChannel {
    sender: Sender<CommandBuffer>,
    receiver: Receiver<CommandBuffer>,
}

thread_local! {
    static LOCAL_BUFFER: RefCell<CommandBuffer> = RefCell::new(CommandBuffer::new());
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        CommandChannel { sender, receiver }
    }

    /// Submit a finished buffer for the writer to drain later.
    pub fn submit(&self, buffer: CommandBuffer) {
        let _ = self.sender.send(buffer);
    }

    /// Run `f` against this thread's scratch buffer, then submit it.
    pub fn record(&self, f: impl FnOnce(&mut CommandBuffer)) {
        let buffer = LOCAL_BUFFER.with(|cell| {
            let mut buffer = cell.borrow_mut();
            f(&mut buffer);
            std::mem::replace(&mut *buffer, CommandBuffer::new())
        });
        self.submit(buffer);
    }

    /// Drain every buffer submitted so far, applying each in submission
    /// order. Stops at the first failing buffer and reports its error.
    pub fn drain_into(&self, sink: &mut dyn CommandSink) -> Result<usize> {
        #[cfg(feature = "profiling")]
        let _guard = tracing::info_span!("command_buffer_commit").entered();

        let mut applied = 0;
        while let Ok(mut buffer) = self.receiver.try_recv() {
            buffer.apply(sink)?;
            applied += 1;
        }
        Ok(applied)
    }
}
