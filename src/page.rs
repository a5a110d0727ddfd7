//! On-disk page layout.
//!
//! Every page is 4096 bytes and plays one of four roles: the header page of a
//! table file (page 0), a free page threaded onto the free list, a leaf node,
//! or an internal node. All multi-byte fields are little-endian and live at
//! the fixed offsets below; this module is the only place that knows them.

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 128;
pub const SLOT_SIZE: usize = 16;
pub const BRANCH_SIZE: usize = 16;

/// Usable bytes of a freshly initialized leaf.
pub const INITIAL_FREE_SPACE: u64 = (PAGE_SIZE - PAGE_HEADER_SIZE) as u64;
/// A leaf whose free space reaches this rebalances after a delete.
pub const FREE_SPACE_THRESHOLD: u64 = 2500;

pub const MIN_VALUE_SIZE: usize = 50;
pub const MAX_VALUE_SIZE: usize = 112;

/// Keys an internal page holds when full.
pub const NODE_MAX_KEYS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / BRANCH_SIZE;
/// Internal pages rebalance below this.
pub const NODE_MIN_KEYS: usize = NODE_MAX_KEYS / 2;

// Header page (page 0).
const FREE_HEAD_OFFSET: usize = 0;
const NUM_PAGES_OFFSET: usize = 8;
const ROOT_OFFSET: usize = 16;

// Free page.
const NEXT_FREE_OFFSET: usize = 0;

// Node pages (leaf and internal).
const PARENT_OFFSET: usize = 0;
const IS_LEAF_OFFSET: usize = 8;
const NUM_KEYS_OFFSET: usize = 12;
const PAGE_LSN_OFFSET: usize = 24;

// Leaf pages.
const FREE_SPACE_OFFSET: usize = 112;
const RIGHT_SIBLING_OFFSET: usize = 120;

// Internal pages.
const LEFTMOST_CHILD_OFFSET: usize = 120;

// Slot fields, relative to the slot start.
const SLOT_KEY: usize = 0;
const SLOT_SIZE_FIELD: usize = 8;
const SLOT_OFFSET_FIELD: usize = 10;
const SLOT_TRX_FIELD: usize = 12;

pub type PageNum = u64;

/// One record descriptor in a leaf's slot array. `offset` points at the
/// packed value, measured from the start of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub key: i64,
    pub size: u16,
    pub offset: u16,
    pub trx_id: u32,
}

/// One separator entry in an internal page: `key` bounds the subtree rooted
/// at `child` from below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub key: i64,
    pub child: PageNum,
}

pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.data[offset..offset + 2].try_into().unwrap())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap())
    }

    fn read_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap())
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_i64(&mut self, offset: usize, value: i64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    // ---- header page ----

    pub fn free_list_head(&self) -> PageNum {
        self.read_u64(FREE_HEAD_OFFSET)
    }

    pub fn set_free_list_head(&mut self, pagenum: PageNum) {
        self.write_u64(FREE_HEAD_OFFSET, pagenum);
    }

    pub fn num_pages(&self) -> u64 {
        self.read_u64(NUM_PAGES_OFFSET)
    }

    pub fn set_num_pages(&mut self, count: u64) {
        self.write_u64(NUM_PAGES_OFFSET, count);
    }

    pub fn root(&self) -> PageNum {
        self.read_u64(ROOT_OFFSET)
    }

    pub fn set_root(&mut self, pagenum: PageNum) {
        self.write_u64(ROOT_OFFSET, pagenum);
    }

    // ---- free page ----

    pub fn next_free_page(&self) -> PageNum {
        self.read_u64(NEXT_FREE_OFFSET)
    }

    pub fn set_next_free_page(&mut self, pagenum: PageNum) {
        self.write_u64(NEXT_FREE_OFFSET, pagenum);
    }

    // ---- node header ----

    pub fn parent(&self) -> PageNum {
        self.read_u64(PARENT_OFFSET)
    }

    pub fn set_parent(&mut self, pagenum: PageNum) {
        self.write_u64(PARENT_OFFSET, pagenum);
    }

    pub fn is_leaf(&self) -> bool {
        self.read_u32(IS_LEAF_OFFSET) != 0
    }

    pub fn num_keys(&self) -> usize {
        self.read_u32(NUM_KEYS_OFFSET) as usize
    }

    pub fn set_num_keys(&mut self, count: usize) {
        self.write_u32(NUM_KEYS_OFFSET, count as u32);
    }

    pub fn page_lsn(&self) -> u64 {
        self.read_u64(PAGE_LSN_OFFSET)
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.write_u64(PAGE_LSN_OFFSET, lsn);
    }

    /// Reset this page as an empty leaf under `parent`.
    pub fn init_leaf(&mut self, parent: PageNum) {
        self.zero();
        self.set_parent(parent);
        self.write_u32(IS_LEAF_OFFSET, 1);
        self.set_free_space(INITIAL_FREE_SPACE);
    }

    /// Reset this page as an empty internal node under `parent`.
    pub fn init_internal(&mut self, parent: PageNum) {
        self.zero();
        self.set_parent(parent);
        self.write_u32(IS_LEAF_OFFSET, 0);
    }

    // ---- leaf ----

    pub fn free_space(&self) -> u64 {
        self.read_u64(FREE_SPACE_OFFSET)
    }

    pub fn set_free_space(&mut self, amount: u64) {
        self.write_u64(FREE_SPACE_OFFSET, amount);
    }

    pub fn right_sibling(&self) -> PageNum {
        self.read_u64(RIGHT_SIBLING_OFFSET)
    }

    pub fn set_right_sibling(&mut self, pagenum: PageNum) {
        self.write_u64(RIGHT_SIBLING_OFFSET, pagenum);
    }

    pub fn slot(&self, index: usize) -> Slot {
        let base = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        Slot {
            key: self.read_i64(base + SLOT_KEY),
            size: self.read_u16(base + SLOT_SIZE_FIELD),
            offset: self.read_u16(base + SLOT_OFFSET_FIELD),
            trx_id: self.read_u32(base + SLOT_TRX_FIELD),
        }
    }

    pub fn set_slot(&mut self, index: usize, slot: &Slot) {
        let base = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.write_i64(base + SLOT_KEY, slot.key);
        self.write_u16(base + SLOT_SIZE_FIELD, slot.size);
        self.write_u16(base + SLOT_OFFSET_FIELD, slot.offset);
        self.write_u32(base + SLOT_TRX_FIELD, slot.trx_id);
    }

    pub fn set_slot_trx(&mut self, index: usize, trx_id: u32) {
        let base = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.write_u32(base + SLOT_TRX_FIELD, trx_id);
    }

    pub fn value(&self, slot: &Slot) -> &[u8] {
        let start = slot.offset as usize;
        &self.data[start..start + slot.size as usize]
    }

    pub fn write_value(&mut self, offset: u16, value: &[u8]) {
        let start = offset as usize;
        self.data[start..start + value.len()].copy_from_slice(value);
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    // ---- internal ----

    pub fn leftmost_child(&self) -> PageNum {
        self.read_u64(LEFTMOST_CHILD_OFFSET)
    }

    pub fn set_leftmost_child(&mut self, pagenum: PageNum) {
        self.write_u64(LEFTMOST_CHILD_OFFSET, pagenum);
    }

    pub fn branch(&self, index: usize) -> Branch {
        let base = PAGE_HEADER_SIZE + index * BRANCH_SIZE;
        Branch {
            key: self.read_i64(base),
            child: self.read_u64(base + 8),
        }
    }

    pub fn set_branch(&mut self, index: usize, branch: &Branch) {
        let base = PAGE_HEADER_SIZE + index * BRANCH_SIZE;
        self.write_i64(base, branch.key);
        self.write_u64(base + 8, branch.child);
    }

    /// Child pointer for descent position `index`: 0 is the leftmost child,
    /// `i > 0` is the child of branch `i - 1`.
    pub fn child_at(&self, index: usize) -> PageNum {
        if index == 0 {
            self.leftmost_child()
        } else {
            self.branch(index - 1).child
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod page_tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(INITIAL_FREE_SPACE, 3968);
        assert_eq!(NODE_MAX_KEYS, 248);
        assert_eq!(NODE_MIN_KEYS, 124);
    }

    #[test]
    fn test_header_page_fields() {
        let mut page = Page::new();
        page.set_free_list_head(7);
        page.set_num_pages(2560);
        page.set_root(42);
        assert_eq!(page.free_list_head(), 7);
        assert_eq!(page.num_pages(), 2560);
        assert_eq!(page.root(), 42);

        // Fields live at their fixed offsets.
        let bytes = page.as_bytes();
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 2560);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 42);
    }

    #[test]
    fn test_leaf_init_and_header() {
        let mut page = Page::new();
        page.init_leaf(3);
        assert!(page.is_leaf());
        assert_eq!(page.parent(), 3);
        assert_eq!(page.num_keys(), 0);
        assert_eq!(page.free_space(), INITIAL_FREE_SPACE);
        assert_eq!(page.right_sibling(), 0);
        assert_eq!(page.page_lsn(), 0);
    }

    #[test]
    fn test_slot_round_trip_at_offset() {
        let mut page = Page::new();
        page.init_leaf(0);
        let slot = Slot {
            key: -19,
            size: 61,
            offset: 4035,
            trx_id: 9,
        };
        page.set_slot(2, &slot);
        assert_eq!(page.slot(2), slot);

        // Third slot starts at 128 + 2 * 16 = 160.
        let bytes = page.as_bytes();
        assert_eq!(i64::from_le_bytes(bytes[160..168].try_into().unwrap()), -19);
        assert_eq!(u16::from_le_bytes(bytes[168..170].try_into().unwrap()), 61);
        assert_eq!(u16::from_le_bytes(bytes[170..172].try_into().unwrap()), 4035);
        assert_eq!(u32::from_le_bytes(bytes[172..176].try_into().unwrap()), 9);
    }

    #[test]
    fn test_value_packing() {
        let mut page = Page::new();
        page.init_leaf(0);
        let value = vec![0xabu8; 50];
        let offset = (PAGE_SIZE - value.len()) as u16;
        page.write_value(offset, &value);
        let slot = Slot {
            key: 1,
            size: value.len() as u16,
            offset,
            trx_id: 0,
        };
        page.set_slot(0, &slot);
        assert_eq!(page.value(&slot), &value[..]);
    }

    #[test]
    fn test_internal_branches() {
        let mut page = Page::new();
        page.init_internal(1);
        assert!(!page.is_leaf());
        page.set_leftmost_child(10);
        page.set_branch(0, &Branch { key: 100, child: 11 });
        page.set_branch(1, &Branch { key: 200, child: 12 });
        page.set_num_keys(2);

        assert_eq!(page.child_at(0), 10);
        assert_eq!(page.child_at(1), 11);
        assert_eq!(page.child_at(2), 12);
        assert_eq!(page.branch(1).key, 200);

        let bytes = page.as_bytes();
        assert_eq!(u64::from_le_bytes(bytes[120..128].try_into().unwrap()), 10);
        assert_eq!(i64::from_le_bytes(bytes[128..136].try_into().unwrap()), 100);
        assert_eq!(u64::from_le_bytes(bytes[136..144].try_into().unwrap()), 11);
    }

    #[test]
    fn test_page_lsn_stamp() {
        let mut page = Page::new();
        page.init_leaf(0);
        page.set_page_lsn(4096);
        assert_eq!(page.page_lsn(), 4096);
        let bytes = page.as_bytes();
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 4096);
    }

    #[test]
    fn test_free_page_chain_field() {
        let mut page = Page::new();
        page.set_next_free_page(55);
        assert_eq!(page.next_free_page(), 55);
    }
}
