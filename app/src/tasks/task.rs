use std::sync::{Arc, Barrier};

pub struct TaskMeta {
    pub name: &'static str,
    pub stack_bytes: Option<usize>,
}

pub trait AppTask {
    fn meta(&self) -> TaskMeta;

    /// Consume what you need from self, then
    /// return a closure that runs the task loop
    fn into_runner(self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static>;
}

pub trait Spawner {
    fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>);
}

/// Spawn every task, then release them all at once so no task observes a
/// half-wired peer. Observers must subscribe before this point.
pub fn start_all(tasks: Vec<Box<dyn AppTask>>) {
    let spawner = TaskSpawner;

    // +1 for the supervisor/main thread to release everybody
    let barrier = Arc::new(Barrier::new(tasks.len() + 1));

    // Build all runners first to heap allocate tasks before they run
    let mut runners: Vec<(TaskMeta, Box<dyn FnOnce() + Send>)> =
        Vec::with_capacity(tasks.len());
    for t in tasks {
        let meta = t.meta();
        let runner = t.into_runner();
        runners.push((meta, runner));
    }

    // Spawn them. Each will wait on the barrier
    for (meta, runner) in runners {
        let b = barrier.clone();
        spawner.spawn(
            meta,
            Box::new(move || {
                // Block on barrier
                b.wait();

                // Then run the task
                runner();
            }),
        );
    }

    // Release them all at once.
    barrier.wait();
}

mod spawner {
    use super::{Spawner, TaskMeta};

    pub struct HostSpawner;

    impl Spawner for HostSpawner {
        fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>) {
            let mut b = std::thread::Builder::new().name(meta.name.into());
            if let Some(stack_sz) = meta.stack_bytes {
                b = b.stack_size(stack_sz);
            }

            b.spawn(move || f()).expect("spawn failed");
        }
    }
}
pub use spawner::HostSpawner as TaskSpawner;
