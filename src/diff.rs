//! Ordered edit scripts between two lists.
//!
//! Scripts follow one convention: removals come first with descending
//! offsets into the old list, then insertions with ascending offsets into the
//! new list. Applying them in order turns the old list into the new one.
//! The common subsequence is found with the linear-space variant of Myers'
//! O(ND) algorithm, so scripts are minimal.

#[derive(Debug, Clone, PartialEq)]
pub enum Edit<T> {
    Remove { offset: usize, element: T },
    Insert { offset: usize, element: T },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditScript<T> {
    edits: Vec<Edit<T>>,
}

impl<T> EditScript<T> {
    pub fn empty() -> Self {
        Self { edits: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Edit<T>> {
        self.edits.iter()
    }

    pub fn removals(&self) -> usize {
        self.edits
            .iter()
            .filter(|edit| matches!(edit, Edit::Remove { .. }))
            .count()
    }

    pub fn insertions(&self) -> usize {
        self.len() - self.removals()
    }

    pub fn into_edits(self) -> Vec<Edit<T>> {
        self.edits
    }
}

impl<T: Clone> EditScript<T> {
    pub fn apply(&self, list: &mut Vec<T>) {
        for edit in &self.edits {
            match edit {
                Edit::Remove { offset, .. } => {
                    list.remove(*offset);
                }
                Edit::Insert { offset, element } => list.insert(*offset, element.clone()),
            }
        }
    }
}

impl<T> IntoIterator for EditScript<T> {
    type Item = Edit<T>;
    type IntoIter = std::vec::IntoIter<Edit<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.edits.into_iter()
    }
}

pub fn diff<T: PartialEq + Clone>(old: &[T], new: &[T]) -> EditScript<T> {
    let mut keep_old = vec![false; old.len()];
    let mut keep_new = vec![false; new.len()];

    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        keep_old[prefix] = true;
        keep_new[prefix] = true;
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        keep_old[old.len() - 1 - suffix] = true;
        keep_new[new.len() - 1 - suffix] = true;
        suffix += 1;
    }

    let myers = Myers { a: old, b: new };
    if let Some(path) = myers.find_path(Bounds {
        left: prefix as isize,
        top: prefix as isize,
        right: (old.len() - suffix) as isize,
        bottom: (new.len() - suffix) as isize,
    }) {
        myers.mark_common(&path, &mut keep_old, &mut keep_new);
    }

    let mut edits = Vec::new();
    for offset in (0..old.len()).rev().filter(|&offset| !keep_old[offset]) {
        edits.push(Edit::Remove {
            offset,
            element: old[offset].clone(),
        });
    }
    for offset in (0..new.len()).filter(|&offset| !keep_new[offset]) {
        edits.push(Edit::Insert {
            offset,
            element: new[offset].clone(),
        });
    }
    EditScript { edits }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    left: isize,
    top: isize,
    right: isize,
    bottom: isize,
}

impl Bounds {
    fn width(&self) -> isize {
        self.right - self.left
    }

    fn height(&self) -> isize {
        self.bottom - self.top
    }

    fn size(&self) -> isize {
        self.width() + self.height()
    }

    fn delta(&self) -> isize {
        self.width() - self.height()
    }
}

type Point = (isize, isize);

struct Myers<'a, T> {
    a: &'a [T],
    b: &'a [T],
}

impl<T: PartialEq> Myers<'_, T> {
    fn same(&self, x: isize, y: isize) -> bool {
        self.a[x as usize] == self.b[y as usize]
    }

    /// Points of an optimal edit path through `bounds`; consecutive points are
    /// joined by at most one non-diagonal step plus diagonals.
    fn find_path(&self, bounds: Bounds) -> Option<Vec<Point>> {
        let (start, finish) = self.midpoint(bounds)?;
        let head = self.find_path(Bounds {
            left: bounds.left,
            top: bounds.top,
            right: start.0,
            bottom: start.1,
        });
        let tail = self.find_path(Bounds {
            left: finish.0,
            top: finish.1,
            right: bounds.right,
            bottom: bounds.bottom,
        });
        let mut path = head.unwrap_or_else(|| vec![start]);
        path.extend(tail.unwrap_or_else(|| vec![finish]));
        Some(path)
    }

    fn midpoint(&self, bounds: Bounds) -> Option<(Point, Point)> {
        if bounds.size() == 0 {
            return None;
        }
        let max = (bounds.size() + 1) / 2;
        let offset = max + 1;
        let len = (2 * max + 3) as usize;
        let mut forward = vec![0isize; len];
        let mut backward = vec![0isize; len];
        forward[(1 + offset) as usize] = bounds.left;
        backward[(1 + offset) as usize] = bounds.bottom;

        for d in 0..=max {
            if let Some(snake) = self.forwards(bounds, &mut forward, &backward, d, offset) {
                return Some(snake);
            }
            if let Some(snake) = self.backwards(bounds, &forward, &mut backward, d, offset) {
                return Some(snake);
            }
        }
        None
    }

    fn forwards(
        &self,
        bounds: Bounds,
        forward: &mut [isize],
        backward: &[isize],
        d: isize,
        offset: isize,
    ) -> Option<(Point, Point)> {
        let at = |k: isize| (k + offset) as usize;
        let mut k = d;
        while k >= -d {
            let c = k - bounds.delta();
            let (px, mut x) = if k == -d || (k != d && forward[at(k - 1)] < forward[at(k + 1)]) {
                (forward[at(k + 1)], forward[at(k + 1)])
            } else {
                (forward[at(k - 1)], forward[at(k - 1)] + 1)
            };
            let mut y = bounds.top + (x - bounds.left) - k;
            let py = if d == 0 || x != px { y } else { y - 1 };
            while x < bounds.right && y < bounds.bottom && self.same(x, y) {
                x += 1;
                y += 1;
            }
            forward[at(k)] = x;
            if bounds.size() % 2 != 0 && c >= -(d - 1) && c <= d - 1 && y >= backward[at(c)] {
                return Some(((px, py), (x, y)));
            }
            k -= 2;
        }
        None
    }

    fn backwards(
        &self,
        bounds: Bounds,
        forward: &[isize],
        backward: &mut [isize],
        d: isize,
        offset: isize,
    ) -> Option<(Point, Point)> {
        let at = |k: isize| (k + offset) as usize;
        let mut c = d;
        while c >= -d {
            let k = c + bounds.delta();
            let (py, mut y) = if c == -d || (c != d && backward[at(c - 1)] > backward[at(c + 1)])
            {
                (backward[at(c + 1)], backward[at(c + 1)])
            } else {
                (backward[at(c - 1)], backward[at(c - 1)] - 1)
            };
            let mut x = bounds.left + (y - bounds.top) + k;
            let px = if d == 0 || y != py { x } else { x + 1 };
            while x > bounds.left && y > bounds.top && self.same(x - 1, y - 1) {
                x -= 1;
                y -= 1;
            }
            backward[at(c)] = y;
            if bounds.size() % 2 == 0 && k >= -d && k <= d && x <= forward[at(k)] {
                return Some(((x, y), (px, py)));
            }
            c -= 2;
        }
        None
    }

    fn mark_common(&self, path: &[Point], keep_a: &mut [bool], keep_b: &mut [bool]) {
        for pair in path.windows(2) {
            let ((x1, y1), (x2, y2)) = (pair[0], pair[1]);
            let (mut x, mut y) = self.walk_diagonal((x1, y1), (x2, y2), keep_a, keep_b);
            match (x2 - x).cmp(&(y2 - y)) {
                std::cmp::Ordering::Less => y += 1,
                std::cmp::Ordering::Greater => x += 1,
                std::cmp::Ordering::Equal => {}
            }
            self.walk_diagonal((x, y), (x2, y2), keep_a, keep_b);
        }
    }

    fn walk_diagonal(
        &self,
        from: Point,
        to: Point,
        keep_a: &mut [bool],
        keep_b: &mut [bool],
    ) -> Point {
        let (mut x, mut y) = from;
        while x < to.0 && y < to.1 && self.same(x, y) {
            keep_a[x as usize] = true;
            keep_b[y as usize] = true;
            x += 1;
            y += 1;
        }
        (x, y)
    }
}
