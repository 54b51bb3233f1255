use anyhow::bail;

/// A map from small non-negative integers to values, backed by a vector that grows on demand up
///  to a fixed maximum index. Lookups are a bounds check and an array access.
#[derive(Debug)]
pub struct IdMap<T> {
    entries: Vec<Option<T>>,
    max_index: usize,
    len: usize,
}

impl<T> IdMap<T> {
    pub fn new(max_index: usize) -> IdMap<T> {
        IdMap {
            entries: Vec::new(),
            max_index,
            len: 0,
        }
    }

    pub fn lookup(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
            .and_then(|e| e.as_ref())
    }

    /// Fails if `index` is beyond the map's maximum, or if there is a value stored for `index`
    ///  already - values are never replaced implicitly.
    pub fn set(&mut self, index: usize, value: T) -> anyhow::Result<()> {
        if index >= self.max_index {
            bail!("index {} exceeds the maximum index {}", index, self.max_index);
        }
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }

        let slot = &mut self.entries[index];
        if slot.is_some() {
            bail!("index {} is in use", index);
        }
        *slot = Some(value);
        self.len += 1;
        Ok(())
    }

    pub fn clear(&mut self, index: usize) -> Option<T> {
        let prev = self.entries.get_mut(index)
            .and_then(|e| e.take());
        if prev.is_some() {
            self.len -= 1;
        }
        prev
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries.iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (i, v)))
    }
}
