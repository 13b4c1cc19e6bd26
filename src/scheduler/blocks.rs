use crate::message::Block;

/// Iterates the blocks of one piece, in offset order. The last block may be shorter.
#[derive(Debug)]
pub struct Blocks {
    block_size: usize,
    piece: usize,
    offset: usize,
    end: usize,
}

impl Blocks {
    pub fn new(piece: usize, piece_size: usize, block_size: usize) -> Self {
        Self {
            block_size,
            piece,
            offset: 0,
            end: piece_size,
        }
    }

    pub fn count(piece_size: usize, block_size: usize) -> usize {
        piece_size.div_ceil(block_size)
    }
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset < self.end {
            let length = self.block_size.min(self.end - self.offset);
            let block = Block::new(self.piece, self.offset, length);
            self.offset += length;
            Some(block)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 1024;

    #[test]
    fn one_piece_one_block() {
        let mut blocks = Blocks::new(0, 1024, BLOCK_SIZE);

        assert_eq!(Some(Block::new(0, 0, BLOCK_SIZE)), blocks.next());
        assert_eq!(None, blocks.next());
    }

    #[test]
    fn one_piece_multiple_blocks() {
        let blocks: Vec<_> = Blocks::new(0, 2048, BLOCK_SIZE).collect();

        assert_eq!(
            blocks,
            vec![Block::new(0, 0, BLOCK_SIZE), Block::new(0, 1024, BLOCK_SIZE)]
        );
    }

    #[test]
    fn uneven_last_block() {
        let blocks: Vec<_> = Blocks::new(3, BLOCK_SIZE + 42, BLOCK_SIZE).collect();

        assert_eq!(
            blocks,
            vec![Block::new(3, 0, BLOCK_SIZE), Block::new(3, 1024, 42)]
        );
        assert_eq!(Blocks::count(BLOCK_SIZE + 42, BLOCK_SIZE), 2);
    }

    #[test]
    fn empty_piece() {
        assert_eq!(Blocks::new(0, 0, BLOCK_SIZE).next(), None);
    }
}
