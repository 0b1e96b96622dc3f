/// FlatStorage works similar to map. Each element is assigned a key (index in Vec) of usize type when inserting.
/// The key can be used to read/modify/remove the element. Freed slots are reused, most recently freed first.
pub struct FlatStorage<T> {
    data: Vec<AllocNode<T>>,
    count: usize,
    free: usize,
}

const INVALID_ID: usize = usize::MAX;

enum AllocNode<T> {
    Vacant(usize), // next free slot index
    Occupied(T),
}

impl<T> Default for FlatStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlatStorage<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            count: 0,
            free: INVALID_ID,
        }
    }
    pub fn len(&self) -> usize {
        self.count
    }
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
    /// The key the next `add` will return.
    pub fn next_key(&self) -> usize {
        if self.free == INVALID_ID {
            self.data.len()
        } else {
            self.free
        }
    }
    /// return the key assigned to new added element.
    pub fn add(&mut self, val: T) -> usize {
        self.count += 1;
        if self.free == INVALID_ID {
            self.data.push(AllocNode::Occupied(val));
            return self.data.len() - 1;
        }
        let key = self.free;
        if let AllocNode::Vacant(next) = self.data[key] {
            self.free = next;
        }
        self.data[key] = AllocNode::Occupied(val);
        key
    }

    pub fn remove(&mut self, key: usize) -> Option<T> {
        match self.data.get(key) {
            Some(AllocNode::Occupied(_)) => {}
            _ => return None,
        }
        let node = std::mem::replace(&mut self.data[key], AllocNode::Vacant(self.free));
        self.free = key;
        self.count -= 1;
        match node {
            AllocNode::Occupied(val) => Some(val),
            AllocNode::Vacant(_) => None,
        }
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        match self.data.get(key) {
            Some(AllocNode::Occupied(val)) => Some(val),
            _ => None,
        }
    }
    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        match self.data.get_mut(key) {
            Some(AllocNode::Occupied(val)) => Some(val),
            _ => None,
        }
    }
    /// Iterate (key, element) over occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(key, node)| match node {
                AllocNode::Occupied(val) => Some((key, val)),
                AllocNode::Vacant(_) => None,
            })
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    pub fn test_flat_storage() {
        let mut storage = FlatStorage::new();
        let a = storage.add("a");
        let b = storage.add("b");
        let c = storage.add("c");
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(storage.remove(b), Some("b"));
        assert_eq!(storage.remove(b), None);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.next_key(), b);
        assert_eq!(storage.add("d"), b); // slot reused
        assert_eq!(storage.get(b), Some(&"d"));
        *storage.get_mut(a).unwrap() = "A";
        let all: Vec<_> = storage.iter().map(|(k, v)| (k, *v)).collect();
        assert_eq!(all, vec![(0, "A"), (1, "d"), (2, "c")]);
        assert!(storage.get(17).is_none());
    }
}
