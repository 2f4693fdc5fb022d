// THEORY:
// The `Profiler` records a tree of named, timed phases for the `-perf` report.
// It has to work from any worker thread and must not force every call site to
// know its parent phase.
//
// Key architectural principles:
// 1.  **Arena Storage**: All `TimerNode`s live in one `Vec` behind a mutex and
//     refer to each other by index. There are no back-pointers, so the tree can
//     be rebuilt or re-sorted without touching ownership.
// 2.  **RAII Timers**: `Profiler::start` hands out a `Timer` guard. Dropping the
//     guard stops its node; an explicit `stop` does the same, and stopping twice
//     is a no-op.
// 3.  **Deferred Parents**: A phase may name its parent when it starts. Phases
//     that do not (typically the ones forked onto other threads) are attached in
//     a post-pass: the parent is the nearest earlier node whose wall-clock
//     interval contains the child's interval.

use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One timed phase.
#[derive(Debug, Clone)]
pub struct TimerNode {
    pub name: String,
    /// Index of the parent node in the profiler's arena.
    pub parent: Option<usize>,
    /// Indices of the child nodes.
    pub children: Vec<usize>,
    /// Wall-clock start, relative to the profiler's epoch.
    pub start: Duration,
    /// Wall-clock end, relative to the profiler's epoch. Meaningful once stopped.
    pub end: Duration,
    /// User CPU time spent by the process during the phase.
    pub user: Duration,
    /// System CPU time spent by the process during the phase.
    pub sys: Duration,
    pub stopped: bool,
}

impl TimerNode {
    pub fn real(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    fn contains(&self, other: &TimerNode) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Thread-safe arena of timer nodes.
pub struct Profiler {
    epoch: Instant,
    nodes: Mutex<Vec<TimerNode>>,
}

/// Guard for a running phase. Stops its node when dropped.
pub struct Timer<'p> {
    profiler: &'p Profiler,
    index: usize,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Opens a new phase. `parent` may be omitted and resolved later.
    pub fn start(&self, name: impl Into<String>, parent: Option<&Timer<'_>>) -> Timer<'_> {
        let (user, sys) = cpu_usage();
        let parent = parent.map(|timer| timer.index);
        let mut nodes = self.lock();
        let index = nodes.len();
        nodes.push(TimerNode {
            name: name.into(),
            parent,
            children: Vec::new(),
            start: self.epoch.elapsed(),
            end: Duration::ZERO,
            user,
            sys,
            stopped: false,
        });
        if let Some(parent) = parent {
            nodes[parent].children.push(index);
        }
        Timer {
            profiler: self,
            index,
        }
    }

    fn stop_node(&self, index: usize) {
        let (user, sys) = cpu_usage();
        let end = self.epoch.elapsed();
        let mut nodes = self.lock();
        let node = &mut nodes[index];
        if node.stopped {
            return;
        }
        node.stopped = true;
        node.end = end;
        node.user = user.saturating_sub(node.user);
        node.sys = sys.saturating_sub(node.sys);
    }

    /// Snapshot of the arena in creation order.
    pub fn nodes(&self) -> Vec<TimerNode> {
        self.lock().clone()
    }

    /// Stops every running node (latest first) and attaches unparented nodes
    /// to the nearest earlier node that contains them.
    pub fn finish(&self) {
        let count = self.lock().len();
        for index in (0..count).rev() {
            self.stop_node(index);
        }

        let mut nodes = self.lock();
        for inner in 0..nodes.len() {
            if nodes[inner].parent.is_some() {
                continue;
            }
            let outer = (0..inner).rev().find(|&outer| nodes[outer].contains(&nodes[inner]));
            if let Some(outer) = outer {
                nodes[inner].parent = Some(outer);
                nodes[outer].children.push(inner);
            }
        }
    }

    /// Finishes the tree and renders it as a table, children indented under
    /// their parent and ordered by start time.
    pub fn report(&self) -> String {
        self.finish();
        let mut nodes = self.lock();
        for index in 0..nodes.len() {
            let mut children = std::mem::take(&mut nodes[index].children);
            children.sort_by_key(|&child| nodes[child].start);
            children.dedup();
            nodes[index].children = children;
        }

        let mut out = String::from("     User   System     Real  Name\n");
        for (index, node) in nodes.iter().enumerate() {
            if node.parent.is_none() {
                render_node(&nodes, index, 0, &mut out);
            }
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TimerNode>> {
        // A poisoned arena still holds valid timings.
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Timer<'_> {
    pub fn stop(&self) {
        self.profiler.stop_node(self.index);
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_node(nodes: &[TimerNode], index: usize, depth: usize, out: &mut String) {
    let node = &nodes[index];
    let _ = writeln!(
        out,
        " {:8.3} {:8.3} {:8.3}  {}{}",
        node.user.as_secs_f64(),
        node.sys.as_secs_f64(),
        node.real().as_secs_f64(),
        "  ".repeat(depth),
        node.name
    );
    for &child in &node.children {
        render_node(nodes, child, depth + 1, out);
    }
}

/// User and system CPU time consumed by the whole process so far.
#[cfg(unix)]
fn cpu_usage() -> (Duration, Duration) {
    fn to_duration(t: libc::timeval) -> Duration {
        Duration::from_secs(t.tv_sec.max(0) as u64) + Duration::from_micros(t.tv_usec.max(0) as u64)
    }

    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage only writes into the provided struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return (Duration::ZERO, Duration::ZERO);
    }
    // SAFETY: a zero return code means the struct was filled in.
    let usage = unsafe { usage.assume_init() };
    (to_duration(usage.ru_utime), to_duration(usage.ru_stime))
}

#[cfg(not(unix))]
fn cpu_usage() -> (Duration, Duration) {
    (Duration::ZERO, Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn stop_is_idempotent() {
        let profiler = Profiler::new();
        let timer = profiler.start("phase", None);
        timer.stop();
        let first = profiler.nodes()[0].end;
        sleep(Duration::from_millis(2));
        timer.stop();
        drop(timer);
        let node = &profiler.nodes()[0];
        assert!(node.stopped);
        assert_eq!(node.end, first);
        assert!(node.end >= node.start);
    }

    #[test]
    fn explicit_parent_is_linked_at_creation() {
        let profiler = Profiler::new();
        let outer = profiler.start("outer", None);
        let inner = profiler.start("inner", Some(&outer));
        drop(inner);
        drop(outer);
        let nodes = profiler.nodes();
        assert_eq!(nodes[1].parent, Some(0));
        assert_eq!(nodes[0].children, vec![1]);
    }

    #[test]
    fn nested_phases_render_under_their_container() {
        let profiler = Profiler::new();
        {
            let _a = profiler.start("A", None);
            sleep(Duration::from_millis(3));
            {
                let _b = profiler.start("B", None);
                sleep(Duration::from_millis(3));
            }
            sleep(Duration::from_millis(1));
        }
        {
            let _c = profiler.start("C", None);
            sleep(Duration::from_millis(1));
        }

        let report = profiler.report();
        let names: Vec<&str> = report
            .lines()
            .skip(1)
            .map(|line| line.split("  ").last().unwrap_or_default())
            .collect();
        let a = report.lines().position(|l| l.ends_with("  A")).unwrap();
        let b = report.lines().position(|l| l.ends_with("    B")).unwrap();
        let c = report.lines().position(|l| l.ends_with("  C")).unwrap();
        assert!(a < b && b < c, "unexpected order:\n{report}");
        assert_eq!(names.len(), 3);

        let nodes = profiler.nodes();
        assert_eq!(nodes[1].parent, Some(0));
        assert_eq!(nodes[2].parent, None);
        assert!(nodes[0].real() >= nodes[1].real());
    }

    #[test]
    fn report_stops_running_nodes() {
        let profiler = Profiler::new();
        let _running = profiler.start("running", None);
        let report = profiler.report();
        assert!(report.starts_with("     User   System     Real  Name"));
        assert!(profiler.nodes()[0].stopped);
    }
}
