use mio::Token;

/// Token-indexed storage with slot reuse.
#[derive(Debug)]
pub(crate) struct Slab<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self { slots: Vec::with_capacity(cap), free: Vec::new(), len: 0 }
    }

    /// Stores the value built for the next free token.
    pub(crate) fn insert_with<E>(&mut self, build: impl FnOnce(Token) -> Result<T, E>) -> Result<Token, E> {
        let index = self.free.pop().unwrap_or(self.slots.len());
        let value = match build(Token(index)) {
            Ok(value) => value,
            Err(e) => {
                if index < self.slots.len() {
                    self.free.push(index);
                }
                return Err(e);
            }
        };

        if index == self.slots.len() {
            self.slots.push(Some(value));
        } else {
            self.slots[index] = Some(value);
        }
        self.len += 1;
        Ok(Token(index))
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.slots.get_mut(token.0).and_then(Option::as_mut)
    }

    #[inline]
    pub(crate) fn remove(&mut self, token: Token) -> Option<T> {
        let value = self.slots.get_mut(token.0)?.take()?;
        self.free.push(token.0);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn tokens(&self) -> Vec<Token> {
        self.slots.iter().enumerate().filter(|(_, slot)| slot.is_some()).map(|(i, _)| Token(i)).collect()
    }
}
