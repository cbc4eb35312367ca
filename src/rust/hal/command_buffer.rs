// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    hal::event::Event,
    runtime::fail::Fail,
    task::{
        task::{
            CallFn,
            DispatchFn,
        },
        TaskContext,
        TaskGraph,
        TaskId,
        TaskKind,
        WorkgroupId,
    },
};
use ::std::{
    fmt,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Recording state of a [CommandBuffer].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

enum Command {
    Dispatch {
        workgroup_count: [u32; 3],
        slice_size: u32,
        kernel: DispatchFn,
    },
    Call(CallFn),
    SignalEvent(Event),
    ResetEvent(Event),
    WaitEvents(Vec<Event>),
    ExecutionBarrier,
}

/// One-shot list of commands executed in recorded order.
pub struct CommandBuffer {
    name: String,
    state: CommandBufferState,
    commands: Vec<Command>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CommandBuffer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: CommandBufferState::Initial,
            commands: Vec::new(),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn begin(&mut self) -> Result<(), Fail> {
        self.transition(CommandBufferState::Initial, CommandBufferState::Recording)
    }

    pub fn end(&mut self) -> Result<(), Fail> {
        self.transition(CommandBufferState::Recording, CommandBufferState::Executable)
    }

    /// Records a dispatch of `kernel` over a `workgroup_count` grid.
    pub fn dispatch<F>(&mut self, workgroup_count: [u32; 3], slice_size: u32, kernel: F) -> Result<(), Fail>
    where
        F: Fn(&TaskContext, WorkgroupId) -> Result<(), Fail> + Send + Sync + 'static,
    {
        if slice_size == 0 {
            let cause: String = format!("dispatch in {} has an empty slice size", self.name);
            error!("dispatch(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.record(Command::Dispatch {
            workgroup_count,
            slice_size,
            kernel: Arc::new(kernel),
        })
    }

    /// Records a host call.
    pub fn call<F>(&mut self, f: F) -> Result<(), Fail>
    where
        F: FnOnce(&TaskContext) -> Result<(), Fail> + Send + 'static,
    {
        self.record(Command::Call(Box::new(f)))
    }

    pub fn signal_event(&mut self, event: &Event) -> Result<(), Fail> {
        self.record(Command::SignalEvent(event.clone()))
    }

    pub fn reset_event(&mut self, event: &Event) -> Result<(), Fail> {
        self.record(Command::ResetEvent(event.clone()))
    }

    pub fn wait_events(&mut self, events: &[Event]) -> Result<(), Fail> {
        self.record(Command::WaitEvents(events.to_vec()))
    }

    pub fn execution_barrier(&mut self) -> Result<(), Fail> {
        self.record(Command::ExecutionBarrier)
    }

    fn record(&mut self, command: Command) -> Result<(), Fail> {
        if self.state != CommandBufferState::Recording {
            let cause: String = format!("command buffer {} is not recording (state {:?})", self.name, self.state);
            error!("record(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.commands.push(command);
        Ok(())
    }

    fn transition(&mut self, from: CommandBufferState, to: CommandBufferState) -> Result<(), Fail> {
        if self.state != from {
            let cause: String = format!(
                "command buffer {} cannot move to {:?} from {:?}",
                self.name, to, self.state
            );
            error!("transition(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.state = to;
        Ok(())
    }

    /// Appends the commands to `graph` as a chain that starts after `after`. Returns the tail of the chain, which is
    /// `after` itself for an empty command buffer.
    pub(crate) fn lower(self, graph: &mut TaskGraph, after: Vec<TaskId>) -> Result<Vec<TaskId>, Fail> {
        if self.state != CommandBufferState::Executable {
            let cause: String = format!("command buffer {} is not executable (state {:?})", self.name, self.state);
            error!("lower(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let mut tail: Vec<TaskId> = after;
        for (index, command) in self.commands.into_iter().enumerate() {
            let name: String = format!("{}/{}", self.name, index);
            let id: TaskId = match command {
                Command::Dispatch {
                    workgroup_count,
                    slice_size,
                    kernel,
                } => graph.add(
                    &name,
                    TaskKind::Dispatch {
                        workgroup_count,
                        slice_size,
                        kernel,
                    },
                    &tail,
                )?,
                Command::Call(f) => graph.add(&name, TaskKind::Call(f), &tail)?,
                Command::SignalEvent(event) => graph.call(&name, &tail, move |_| {
                    event.signal();
                    Ok(())
                })?,
                Command::ResetEvent(event) => graph.call(&name, &tail, move |_| {
                    event.reset();
                    Ok(())
                })?,
                // Commands run in recorded order, so every earlier signal already happened.
                Command::WaitEvents(_) | Command::ExecutionBarrier => graph.barrier(&name, &tail)?,
            };
            tail = vec![id];
        }
        Ok(tail)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("commands", &self.commands.len())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        CommandBuffer,
        CommandBufferState,
    };
    use crate::{
        hal::event::Event,
        task::{
            TaskGraph,
            TaskId,
        },
    };
    use ::anyhow::Result;

    #[test]
    fn state_machine() -> Result<()> {
        let mut buffer: CommandBuffer = CommandBuffer::new("cb");
        match buffer.execution_barrier() {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(()) => anyhow::bail!("recording before begin should fail"),
        }
        match buffer.end() {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(()) => anyhow::bail!("end before begin should fail"),
        }
        buffer.begin()?;
        crate::ensure_eq!(buffer.state(), CommandBufferState::Recording);
        buffer.execution_barrier()?;
        buffer.end()?;
        crate::ensure_eq!(buffer.state(), CommandBufferState::Executable);
        match buffer.begin() {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(()) => anyhow::bail!("command buffers are one-shot"),
        }
        crate::ensure_eq!(buffer.len(), 1);
        Ok(())
    }

    #[test]
    fn lowers_to_a_chain() -> Result<()> {
        let event: Event = Event::new();
        let mut buffer: CommandBuffer = CommandBuffer::new("cb");
        buffer.begin()?;
        buffer.signal_event(&event)?;
        buffer.wait_events(&[event.clone()])?;
        buffer.dispatch([2, 1, 1], 1, |_, _| Ok(()))?;
        buffer.call(|_| Ok(()))?;
        buffer.reset_event(&event)?;
        buffer.end()?;

        let mut graph: TaskGraph = TaskGraph::new("lowered");
        let start: TaskId = graph.barrier("start", &[])?;
        let tail: Vec<TaskId> = buffer.lower(&mut graph, vec![start])?;
        crate::ensure_eq!(graph.len(), 6);
        crate::ensure_eq!(tail.len(), 1);
        crate::ensure_eq!(tail[0].index(), 5);
        Ok(())
    }

    #[test]
    fn refuses_to_lower_while_recording() -> Result<()> {
        let mut buffer: CommandBuffer = CommandBuffer::new("open");
        buffer.begin()?;
        let mut graph: TaskGraph = TaskGraph::new("lowered");
        match buffer.lower(&mut graph, vec![]) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(_) => anyhow::bail!("recording buffer should not lower"),
        }
        Ok(())
    }
}
