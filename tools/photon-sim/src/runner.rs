//! Executes scenarios against a kernel on the host port.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail, ensure};
use photon_core::port::host::HostPort;
use photon_core::{
    Kernel, KernelError, MutexId, MutexMeta, MutexProtocol, Priority, SemaphoreId, TaskId,
    TaskMeta, WaitQueueId, WaitStatus,
};

use crate::scenario::{self, ErrorName, Expectation, Op, ProtocolDecl, Scenario, Step};

/// Object names are leaked once per scenario; the kernel stores `&'static str`.
fn leak(name: &str) -> &'static str {
    Box::leak(name.to_owned().into_boxed_str())
}

fn describe(status: Result<WaitStatus, KernelError>) -> String {
    match status {
        Ok(WaitStatus::Completed) => "completed".into(),
        Ok(WaitStatus::Pending) => "pending".into(),
        Err(err) => ErrorName::of(err).as_str().into(),
    }
}

pub struct Runner {
    kernel: Kernel<HostPort>,
    tasks: HashMap<String, TaskId>,
    names: HashMap<TaskId, String>,
    mutexes: HashMap<String, MutexId>,
    semaphores: HashMap<String, SemaphoreId>,
    queues: HashMap<String, WaitQueueId>,
    /// Print every step and context switch.
    verbose: bool,
}

impl Runner {
    /// Builds the kernel and the declared objects.
    pub fn new(scenario: &Scenario, verbose: bool) -> Result<Self> {
        let kernel = Kernel::new(HostPort::new(), scenario.kernel.config())
            .map_err(|err| anyhow!("invalid [kernel] section: {err}"))?;
        let mut runner = Self {
            kernel,
            tasks: HashMap::new(),
            names: HashMap::new(),
            mutexes: HashMap::new(),
            semaphores: HashMap::new(),
            queues: HashMap::new(),
            verbose,
        };

        for decl in &scenario.tasks {
            let meta = TaskMeta::new(leak(&decl.name)).with_priority(Priority::new(decl.priority));
            let id = runner
                .kernel
                .create_task(meta)
                .map_err(|err| anyhow!("task '{}': {err}", decl.name))?;
            runner.tasks.insert(decl.name.clone(), id);
            runner.names.insert(id, decl.name.clone());
        }
        for decl in &scenario.mutexes {
            let protocol = match decl.protocol {
                ProtocolDecl::None => MutexProtocol::None,
                ProtocolDecl::Inherit => MutexProtocol::Inherit,
                ProtocolDecl::Ceiling => {
                    let ceiling = decl
                        .ceiling
                        .with_context(|| format!("mutex '{}': ceiling protocol needs `ceiling`", decl.name))?;
                    MutexProtocol::Ceiling(Priority::new(ceiling))
                }
            };
            let meta = MutexMeta::new(leak(&decl.name))
                .with_protocol(protocol)
                .with_order(decl.order.into());
            let id = runner
                .kernel
                .mutex_create(meta)
                .map_err(|err| anyhow!("mutex '{}': {err}", decl.name))?;
            runner.mutexes.insert(decl.name.clone(), id);
        }
        for decl in &scenario.semaphores {
            let id = runner
                .kernel
                .semaphore_create(decl.initial, decl.max)
                .map_err(|err| anyhow!("semaphore '{}': {err}", decl.name))?;
            runner.semaphores.insert(decl.name.clone(), id);
        }
        for decl in &scenario.queues {
            let id = runner
                .kernel
                .wait_queue_create(decl.order.into())
                .map_err(|err| anyhow!("queue '{}': {err}", decl.name))?;
            runner.queues.insert(decl.name.clone(), id);
        }

        for decl in scenario.tasks.iter().filter(|decl| decl.activate) {
            let id = runner.task(&decl.name)?;
            runner
                .kernel
                .activate(id)
                .map_err(|err| anyhow!("activating '{}': {err}", decl.name))?;
        }
        if scenario.kernel.start {
            runner
                .kernel
                .start()
                .map_err(|err| anyhow!("start: {err}"))?;
        }
        runner.report_switches();
        runner.check_invariants()?;
        Ok(runner)
    }

    /// Runs every step, stopping at the first failed expectation.
    pub fn run(&mut self, steps: &[Step]) -> Result<()> {
        for (index, step) in steps.iter().enumerate() {
            self.step(step)
                .with_context(|| format!("step {} ({:?})", index + 1, step.op))?;
        }
        Ok(())
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        let outcome = if step.interrupt {
            let port = self.kernel.port();
            port.set_interrupt_context(true);
            let outcome = self.apply(&step.op);
            port.set_interrupt_context(false);
            outcome?
        } else {
            self.apply(&step.op)?
        };

        match (outcome, step.error) {
            (Ok(text), None) => self.trace(&step.op, &text),
            (Err(err), Some(expected)) if ErrorName::of(err) == expected => {
                self.trace(&step.op, expected.as_str());
            }
            (Err(err), expected) => {
                bail!(
                    "failed with {}, expected {}",
                    ErrorName::of(err).as_str(),
                    expected.map_or("success", ErrorName::as_str)
                );
            }
            (Ok(text), Some(expected)) => {
                bail!("returned {text}, expected {}", expected.as_str());
            }
        }
        self.report_switches();
        self.check_invariants()
    }

    /// Issues one operation. The outer error is a scenario mistake or a
    /// failed expectation; the inner one is what the kernel returned.
    fn apply(&self, op: &Op) -> Result<Result<String, KernelError>> {
        let k = &self.kernel;
        let done = |r: Result<(), KernelError>| r.map(|()| "ok".to_owned());
        Ok(match op {
            Op::Activate { task } => done(k.activate(self.task(task)?)),
            Op::Suspend { task } => done(k.suspend(self.task(task)?)),
            Op::Resume { task } => done(k.resume(self.task(task)?)),
            Op::Terminate { task } => done(k.terminate(self.task(task)?)),
            Op::SetPriority { task, priority } => {
                done(k.set_priority(self.task(task)?, Priority::new(*priority)))
            }
            Op::Lock {
                task,
                mutex,
                timeout,
            } => k
                .mutex_lock(self.task(task)?, self.mutex(mutex)?, scenario::timeout(*timeout))
                .map(|status| describe(Ok(status))),
            Op::TryLock { task, mutex } => done(k.mutex_try_lock(self.task(task)?, self.mutex(mutex)?)),
            Op::Unlock { task, mutex } => done(k.mutex_unlock(self.task(task)?, self.mutex(mutex)?)),
            Op::DeleteMutex { mutex } => k
                .mutex_delete(self.mutex(mutex)?)
                .map(|woken| format!("{woken} waiters released")),
            Op::Wait {
                task,
                queue,
                timeout,
            } => k
                .wait_on(self.task(task)?, self.queue(queue)?, scenario::timeout(*timeout))
                .map(|status| describe(Ok(status))),
            Op::SignalOne { queue } => k
                .signal_one(self.queue(queue)?)
                .map(|woken| self.woken(woken)),
            Op::SignalAll { queue } => k
                .signal_all(self.queue(queue)?)
                .map(|woken| format!("{woken} woken")),
            Op::Take {
                task,
                semaphore,
                timeout,
            } => k
                .semaphore_take(
                    self.task(task)?,
                    self.semaphore(semaphore)?,
                    scenario::timeout(*timeout),
                )
                .map(|status| describe(Ok(status))),
            Op::Give { semaphore } => k
                .semaphore_give(self.semaphore(semaphore)?)
                .map(|woken| self.woken(woken)),
            Op::Sleep { task, ticks } => k
                .sleep(self.task(task)?, *ticks)
                .map(|status| describe(Ok(status))),
            Op::ReleaseWait { task } => done(k.release_wait(self.task(task)?)),
            Op::Yield { task } => done(k.yield_now(self.task(task)?)),
            Op::Tick { count } => {
                let mut expired = 0;
                for _ in 0..*count {
                    match k.tick() {
                        Ok(n) => expired += n,
                        Err(err) => return Ok(Err(err)),
                    }
                }
                Ok(format!("now {}, {expired} expired", k.now()))
            }
            Op::Expect(expectation) => {
                self.expect(expectation)?;
                Ok("ok".to_owned())
            }
        })
    }

    fn expect(&self, e: &Expectation) -> Result<()> {
        let k = &self.kernel;
        if let Some(running) = &e.running {
            let actual = self.name_of(k.running());
            ensure!(*running == actual, "running is {actual}, expected {running}");
        }
        if let Some(now) = e.now {
            ensure!(k.now() == now, "now is {}, expected {now}", k.now());
        }

        let task_fields = e.priority.is_some()
            || e.base_priority.is_some()
            || e.state.is_some()
            || e.outcome.is_some();
        if let Some(name) = &e.task {
            let id = self.task(name)?;
            let info = k.task_info(id).map_err(|err| anyhow!("task '{name}': {err}"))?;
            if let Some(priority) = e.priority {
                let actual = info.current_priority.as_u8();
                ensure!(actual == priority, "'{name}' priority is {actual}, expected {priority}");
            }
            if let Some(priority) = e.base_priority {
                let actual = info.base_priority.as_u8();
                ensure!(
                    actual == priority,
                    "'{name}' base priority is {actual}, expected {priority}"
                );
            }
            if let Some(state) = &e.state {
                let actual = info.state.to_string();
                ensure!(actual == *state, "'{name}' is {actual}, expected {state}");
            }
            if let Some(outcome) = &e.outcome {
                let actual = describe(k.wait_outcome(id));
                ensure!(actual == *outcome, "'{name}' outcome is {actual}, expected {outcome}");
            }
        } else {
            ensure!(!task_fields, "task fields given without `task`");
        }

        if let Some(name) = &e.mutex {
            let info = k
                .mutex_info(self.mutex(name)?)
                .map_err(|err| anyhow!("mutex '{name}': {err}"))?;
            if let Some(holder) = &e.holder {
                let actual = info.holder.map_or_else(|| "none".to_owned(), |id| self.name_of(Some(id)));
                ensure!(actual == *holder, "'{name}' held by {actual}, expected {holder}");
            }
        } else {
            ensure!(e.holder.is_none(), "`holder` given without `mutex`");
        }

        if let Some(name) = &e.semaphore {
            let actual = k
                .semaphore_count(self.semaphore(name)?)
                .map_err(|err| anyhow!("semaphore '{name}': {err}"))?;
            if let Some(count) = e.count {
                ensure!(actual == count, "'{name}' count is {actual}, expected {count}");
            }
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<()> {
        self.kernel
            .check_invariants()
            .map_err(|violation| anyhow!("invariant violated: {violation}"))?;
        let nesting = self.kernel.port().critical_nesting();
        ensure!(nesting == 0, "critical section left open (nesting {nesting})");
        Ok(())
    }

    fn report_switches(&self) {
        for switch in self.kernel.port().take_switches() {
            if self.verbose {
                println!(
                    "        switch {} -> {}",
                    self.name_of(switch.from),
                    self.name_of(switch.to)
                );
            }
        }
    }

    fn trace(&self, op: &Op, result: &str) {
        if self.verbose {
            println!("  {op:?} => {result}");
        }
    }

    fn woken(&self, task: Option<TaskId>) -> String {
        match task {
            Some(_) => format!("woke {}", self.name_of(task)),
            None => "no waiter".to_owned(),
        }
    }

    fn name_of(&self, task: Option<TaskId>) -> String {
        match task {
            Some(id) => self.names.get(&id).cloned().unwrap_or_else(|| id.to_string()),
            None => "idle".to_owned(),
        }
    }

    fn task(&self, name: &str) -> Result<TaskId> {
        self.tasks
            .get(name)
            .copied()
            .with_context(|| format!("unknown task '{name}'"))
    }

    fn mutex(&self, name: &str) -> Result<MutexId> {
        self.mutexes
            .get(name)
            .copied()
            .with_context(|| format!("unknown mutex '{name}'"))
    }

    fn semaphore(&self, name: &str) -> Result<SemaphoreId> {
        self.semaphores
            .get(name)
            .copied()
            .with_context(|| format!("unknown semaphore '{name}'"))
    }

    fn queue(&self, name: &str) -> Result<WaitQueueId> {
        self.queues
            .get(name)
            .copied()
            .with_context(|| format!("unknown queue '{name}'"))
    }
}

/// Runs a scenario to completion.
pub fn execute(scenario: &Scenario, verbose: bool) -> Result<()> {
    let mut runner = Runner::new(scenario, verbose)?;
    runner.run(&scenario.steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLED: &[(&str, &str)] = &[
        ("inheritance", include_str!("../scenarios/inheritance.toml")),
        ("fifo-handover", include_str!("../scenarios/fifo-handover.toml")),
        ("timeout", include_str!("../scenarios/timeout.toml")),
        ("suspend-delete", include_str!("../scenarios/suspend-delete.toml")),
        ("semaphore", include_str!("../scenarios/semaphore.toml")),
    ];

    #[test]
    fn bundled_scenarios_pass() {
        for (name, content) in BUNDLED {
            let scenario = Scenario::parse(content).unwrap();
            if let Err(err) = execute(&scenario, false) {
                panic!("{name}: {err:#}");
            }
        }
    }

    #[test]
    fn failed_expectation_is_reported() {
        let scenario = Scenario::parse(
            r#"
            [[task]]
            name = "a"
            priority = 3

            [[step]]
            op = "expect"
            running = "idle"
            "#,
        )
        .unwrap();
        let err = execute(&scenario, false).unwrap_err();
        assert!(format!("{err:#}").contains("running is a, expected idle"));
    }

    #[test]
    fn expected_error_must_occur() {
        let scenario = Scenario::parse(
            r#"
            [[task]]
            name = "a"
            priority = 3

            [[step]]
            op = "suspend"
            task = "a"
            error = "wrong_state"
            "#,
        )
        .unwrap();
        let err = execute(&scenario, false).unwrap_err();
        assert!(format!("{err:#}").contains("expected wrong_state"));
    }

    #[test]
    fn interrupt_steps_see_wrong_context() {
        let scenario = Scenario::parse(
            r#"
            [[task]]
            name = "a"
            priority = 3

            [[mutex]]
            name = "m"

            [[step]]
            op = "lock"
            task = "a"
            mutex = "m"
            interrupt = true
            error = "wrong_context"

            [[step]]
            op = "tick"
            interrupt = true
            "#,
        )
        .unwrap();
        execute(&scenario, false).unwrap();
    }

    #[test]
    fn unknown_names_are_scenario_errors() {
        let scenario = Scenario::parse(
            r#"
            [[step]]
            op = "activate"
            task = "ghost"
            "#,
        )
        .unwrap();
        let err = execute(&scenario, false).unwrap_err();
        assert!(format!("{err:#}").contains("unknown task 'ghost'"));
    }
}
