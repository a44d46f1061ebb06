//! Occupancy-tracked simulation containers and the per-cycle occupancy
//! histogram that exposes them to the statistic system.

use crate::sched::{Phase, RepeatingEvent};
use crate::tree::{CounterBehavior, TreeNode};
use st_common::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Anything with a name, a capacity and a current fill level.
pub trait Occupancy {
    fn name(&self) -> &str;
    fn capacity(&self) -> usize;
    fn occupancy(&self) -> usize;

    fn is_full(&self) -> bool {
        self.occupancy() >= self.capacity()
    }

    /// Fill level in `[0, 1]`.
    fn utilization(&self) -> f64 {
        if self.capacity() == 0 {
            0.0
        } else {
            self.occupancy() as f64 / self.capacity() as f64
        }
    }
}

/// Bounded, indexable storage.
#[derive(Debug, Clone)]
pub struct Buffer<T> {
    name: String,
    capacity: usize,
    items: Vec<T>,
}

impl<T> Buffer<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push_back(&mut self, item: T) -> Result<usize> {
        if self.items.len() >= self.capacity {
            return Err(Error::IllegalOperation(format!(
                "buffer '{}' is full ({} entries)",
                self.name, self.capacity
            )));
        }
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    pub fn insert(&mut self, index: usize, item: T) -> Result<()> {
        if self.items.len() >= self.capacity {
            return Err(Error::IllegalOperation(format!("buffer '{}' is full", self.name)));
        }
        if index > self.items.len() {
            return Err(Error::IllegalOperation(format!(
                "buffer '{}': insert position {} is past the end ({})",
                self.name,
                index,
                self.items.len()
            )));
        }
        self.items.insert(index, item);
        Ok(())
    }

    pub fn erase(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn read(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Occupancy for Buffer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn occupancy(&self) -> usize {
        self.items.len()
    }
}

/// Bounded FIFO.
#[derive(Debug, Clone)]
pub struct Queue<T> {
    name: String,
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> Queue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        if self.items.len() >= self.capacity {
            return Err(Error::IllegalOperation(format!(
                "queue '{}' is full ({} entries)",
                self.name, self.capacity
            )));
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Occupancy for Queue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn occupancy(&self) -> usize {
        self.items.len()
    }
}

/// Samples an occupancy once per cycle in [`Phase::PostTick`].
///
/// Device-tree layout under `<parent>.<name>`:
/// - `bin_<k>`: cycles spent at occupancy k (occupancies above capacity
///   land in the last bin)
/// - `total`: cycles sampled
/// - `max_occupancy`: highest occupancy seen
/// - `capacity`: parameter
/// - `weighted_avg`, `max_utilization`: statistic definitions
pub struct CycleHistogramStandalone {
    node: Rc<TreeNode>,
    bins: Vec<Rc<TreeNode>>,
    total: Rc<TreeNode>,
    max_occupancy: Rc<TreeNode>,
    sampler: RepeatingEvent,
}

impl CycleHistogramStandalone {
    /// Attach a histogram fed by `sample`.
    pub fn attach(
        parent: &Rc<TreeNode>,
        name: &str,
        capacity: usize,
        sample: impl Fn() -> usize + 'static,
    ) -> Result<Self> {
        let node = parent.add_child(TreeNode::container(name))?;
        let clock = node
            .clock()
            .ok_or_else(|| Error::Construction(format!("'{}' has no clock to sample on", node.location())))?;

        let bins = (0..=capacity)
            .map(|k| {
                node.add_child(TreeNode::counter(
                    format!("bin_{}", k),
                    format!("cycles at occupancy {}", k),
                    CounterBehavior::Normal,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let total = node.add_child(TreeNode::counter("total", "cycles sampled", CounterBehavior::Normal))?;
        let max_occupancy = node.add_child(TreeNode::counter(
            "max_occupancy",
            "highest occupancy seen",
            CounterBehavior::Latest,
        ))?;
        node.add_child(TreeNode::parameter("capacity", "container capacity", capacity as f64))?;

        let weighted: Vec<String> = (1..=capacity).map(|k| format!("{} * bin_{}", k, k)).collect();
        let sum = if weighted.is_empty() {
            "0".to_string()
        } else {
            weighted.join(" + ")
        };
        node.add_child(TreeNode::statistic_def(
            "weighted_avg",
            "time-weighted average occupancy",
            format!("ifnan(({}) / total, 0)", sum),
        ))?;
        node.add_child(TreeNode::statistic_def(
            "max_utilization",
            "highest occupancy over capacity",
            "ifnan(max_occupancy / capacity, 0)",
        ))?;

        let bin_nodes: Vec<_> = bins.iter().map(Rc::downgrade).collect();
        let total_node = Rc::downgrade(&total);
        let max_node = Rc::downgrade(&max_occupancy);
        let sampler = clock.every_cycle(Phase::PostTick, move || {
            let occupancy = sample().min(capacity);
            let (Some(bin), Some(total), Some(max)) = (
                bin_nodes.get(occupancy).and_then(|b| b.upgrade()),
                total_node.upgrade(),
                max_node.upgrade(),
            ) else {
                return false;
            };
            bin.increment(1);
            total.increment(1);
            if occupancy as u64 > max.get() {
                max.set(occupancy as f64);
            }
            true
        });

        Ok(Self {
            node,
            bins,
            total,
            max_occupancy,
            sampler,
        })
    }

    /// Attach a histogram over a shared container.
    pub fn for_container<O: Occupancy + 'static>(parent: &Rc<TreeNode>, container: &Rc<RefCell<O>>) -> Result<Self> {
        let (name, capacity) = {
            let c = container.borrow();
            (format!("{}_occupancy", c.name()), c.capacity())
        };
        let source = Rc::clone(container);
        Self::attach(parent, &name, capacity, move || source.borrow().occupancy())
    }

    pub fn node(&self) -> &Rc<TreeNode> {
        &self.node
    }

    pub fn bin(&self, k: usize) -> u64 {
        self.bins.get(k).map_or(0, |b| b.get())
    }

    pub fn total(&self) -> u64 {
        self.total.get()
    }

    pub fn max_occupancy(&self) -> u64 {
        self.max_occupancy.get()
    }

    /// Stop sampling; counters keep their values.
    pub fn stop(&self) {
        self.sampler.cancel();
    }
}

impl Drop for CycleHistogramStandalone {
    fn drop(&mut self) {
        self.sampler.cancel();
    }
}
