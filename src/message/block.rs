use std::fmt::{Debug, Formatter};

/// A block request: a byte range within a piece.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    pub piece: usize,
    pub offset: usize,
    pub length: usize,
}

impl Block {
    pub fn new(piece: usize, offset: usize, length: usize) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    pub fn global_offset(&self, piece_size: usize) -> usize {
        (self.piece * piece_size) + self.offset
    }

    /// Index of this block within its piece.
    pub fn index(&self, block_size: usize) -> usize {
        self.offset / block_size
    }
}

/// Block contents, as carried by a `piece` message.
#[derive(PartialEq, Eq, Clone)]
pub struct BlockData {
    pub piece: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl BlockData {
    pub fn new(block: Block, data: Vec<u8>) -> Self {
        Self {
            piece: block.piece,
            offset: block.offset,
            data,
        }
    }
}

impl From<&BlockData> for Block {
    fn from(value: &BlockData) -> Self {
        Self::new(value.piece, value.offset, value.data.len())
    }
}

impl Debug for BlockData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockData {{ piece: {}, offset: {}, data: <{} bytes> }}",
            self.piece,
            self.offset,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_from_data() {
        let data = BlockData::new(Block::new(2, 16384, 3), vec![1, 2, 3]);

        assert_eq!(Block::from(&data), Block::new(2, 16384, 3));
        assert_eq!(Block::from(&data).index(16384), 1);
        assert_eq!(Block::from(&data).global_offset(32768), 81920);
    }
}
