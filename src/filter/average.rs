// Fixed-capacity moving average over recent positions

use std::collections::VecDeque;

use crate::record::Position3D;

/// FIFO window of the last `capacity` positions
#[derive(Debug, Clone, PartialEq)]
pub struct MovingAverage {
    window: VecDeque<Position3D>,
    capacity: usize,
}

impl MovingAverage {
    /// A zero capacity is treated as 1 (no smoothing)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a position, evicting the oldest beyond capacity, and return the window mean
    pub fn push(&mut self, position: Position3D) -> Position3D {
        self.window.push_back(position);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.mean()
    }

    fn mean(&self) -> Position3D {
        let n = self.window.len() as f64;
        let sum = self.window.iter().fold(Position3D::default(), |acc, p| {
            Position3D::new(acc.x + p.x, acc.y + p.y, acc.z + p.z)
        });
        Position3D::new(sum.x / n, sum.y / n, sum.z / n)
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
