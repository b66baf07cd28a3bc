//! Shared fuzzing and testing infrastructure for `segregated_fit`.

use allocator_api2::alloc::Global;
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segregated_fit::{layout::DOUBLE_WORD, Addr, Arena, FixedArena, Heap};
use std::collections::BTreeMap;

#[cfg(test)]
mod scenarios;

/// The heap type that the test operations run against.
pub type TestHeap = Heap<FixedArena<Global>>;

/// Create a fresh heap whose arena can grow to at most `capacity` bytes.
pub fn new_heap(capacity: usize) -> Result<TestHeap, String> {
    let arena = FixedArena::new(Global, capacity)
        .map_err(|_| format!("failed to reserve a {capacity} byte arena"))?;
    Heap::new(arena).map_err(|_| format!("failed to bootstrap a heap in {capacity} bytes"))
}

/// The requested payload size of a test allocation.
//
// Note: a newtype so that we can give sizes a default mutator that favors
// small, realistic requests over the whole `usize` range.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size(usize);

impl Size {
    /// Create a new `Size`.
    pub fn new(size: usize) -> Self {
        Size(size)
    }

    /// Get the size in bytes.
    pub fn get(self) -> usize {
        self.0
    }
}

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        // Large enough to span every bounded size class and to force the
        // arena to grow by more than one chunk at a time.
        Self {
            max_size: 20 * 1024,
        }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Anywhere in range.
        c.mutation(|ctx| {
            // Corpus inputs may hold any size, so clamp before adding one.
            let max_size = if ctx.shrink() {
                size.0.min(self.max_size)
            } else {
                self.max_size
            };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Small sizes, where most of the size classes and the split/no-split
        // boundaries are.
        if !c.shrink() {
            c.mutation(|ctx| {
                size.0 = ctx.rng().gen_index(4 * DOUBLE_WORD + 1).unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Free { id: u32 },
    Realloc { id: u32, size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// The `bincode` configuration of the fuzz corpus.
const fn corpus_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Free { id } | Op::Realloc { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Free an existing allocation at some later point.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation at some later point.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let realloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(realloc_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one to remove.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// The number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether there are no operations at all.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Decode operations from a fuzz input.
    pub fn decode(data: &[u8]) -> Option<Self> {
        bincode::decode_from_slice(data, corpus_config())
            .ok()
            .map(|(ops, _)| ops)
    }

    /// Encode these operations into `buf`, dropping operations off the end
    /// until the encoding fits. Returns the encoded length, or `None` if not
    /// even the empty sequence fits.
    pub fn encode_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        loop {
            if let Ok(len) = bincode::encode_into_slice(&*self, buf, corpus_config()) {
                return Some(len);
            }
            if !self.pop() {
                return None;
            }
        }
    }

    /// Run these test operations in a fresh heap whose arena can grow to at
    /// most `arena_capacity` bytes.
    pub fn run(&self, arena_capacity: usize) -> Result<(), String> {
        self.run_with_heap(new_heap(arena_capacity)?)
    }

    /// Run these test operations against the given heap, checking the heap's
    /// invariants and the contents of every live allocation after each one.
    pub fn run_with_heap<G>(&self, mut heap: Heap<G>) -> Result<(), String>
    where
        G: Arena,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = BTreeMap::<u32, LiveAlloc>::new();

        // Assert that a block handed out by the heap is well-formed and does
        // not overlap any other live block.
        let assert_new_block = |heap: &Heap<G>,
                                live: &BTreeMap<u32, LiveAlloc>,
                                addr: Addr,
                                size: usize|
         -> Result<(), String> {
            ensure!(
                addr.offset() % DOUBLE_WORD == 0,
                "payload offset {:#x} is not double-word aligned",
                addr.offset(),
            );
            ensure!(
                heap.ptr(addr).as_ptr() as usize % DOUBLE_WORD == 0,
                "payload pointer {:p} is not double-word aligned",
                heap.ptr(addr),
            );
            ensure!(
                heap.usable_size(addr) >= size,
                "block at {:#x} has room for {} bytes but {size} were requested",
                addr.offset(),
                heap.usable_size(addr),
            );

            let start = addr.offset();
            let end = start + heap.usable_size(addr);
            for other in live.values() {
                let other_start = other.addr.offset();
                let other_end = other_start + heap.usable_size(other.addr);
                ensure!(
                    end <= other_start || other_end <= start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        // Assert that every live allocation still holds what we wrote.
        let assert_contents = |heap: &Heap<G>, live: &BTreeMap<u32, LiveAlloc>| {
            for (id, alloc) in live {
                let payload = &heap.payload(alloc.addr)[..alloc.size];
                ensure!(
                    payload.iter().all(|b| *b == alloc.pattern),
                    "contents of id{id} at {:#x} were clobbered",
                    alloc.addr.offset(),
                );
            }
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => {
                    if let Some(old) = live.remove(&id) {
                        heap.free(Some(old.addr));
                    }

                    match heap.allocate(size.get()) {
                        Ok(Some(addr)) => {
                            ensure!(size.get() != 0, "zero-sized allocation returned a block");
                            assert_new_block(&heap, &live, addr, size.get())?;
                            let alloc = LiveAlloc::new(id, addr, size.get());
                            alloc.fill(&mut heap, 0);
                            log::debug!("new allocation: id{id} -> {alloc:?}");
                            live.insert(id, alloc);
                        }
                        Ok(None) => {
                            ensure!(size.get() == 0, "allocation returned no block");
                        }
                        Err(_) => {
                            log::debug!("allocation of {} bytes failed", size.get());
                        }
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(&id) {
                        log::debug!("freeing id{id} -> {alloc:?}");
                        heap.free(Some(alloc.addr));
                    }
                }

                Op::Realloc { id, size } => {
                    let old = live.remove(&id);
                    match heap.reallocate(old.map(|a| a.addr), size.get()) {
                        Ok(Some(addr)) => {
                            ensure!(size.get() != 0, "zero-sized reallocation returned a block");
                            assert_new_block(&heap, &live, addr, size.get())?;

                            let preserved = old.map_or(0, |old| old.size.min(size.get()));
                            let pattern = LiveAlloc::pattern_for(id);
                            ensure!(
                                heap.payload(addr)[..preserved]
                                    .iter()
                                    .all(|b| *b == pattern),
                                "reallocation did not preserve the first {preserved} bytes",
                            );

                            let alloc = LiveAlloc::new(id, addr, size.get());
                            alloc.fill(&mut heap, preserved);
                            log::debug!("reallocated: id{id} -> {alloc:?}");
                            live.insert(id, alloc);
                        }
                        Ok(None) => {
                            ensure!(size.get() == 0, "reallocation returned no block");
                        }
                        Err(_) => {
                            log::debug!("reallocation to {} bytes failed", size.get());
                            // The old block must be left as it was.
                            if let Some(old) = old {
                                live.insert(id, old);
                            }
                        }
                    }
                }
            }

            heap.check()
                .map_err(|e| format!("heap check failed after {op:?}: {e}"))?;
            assert_contents(&heap, &live)?;
        }

        // Finally, free any remaining live allocations. Everything should
        // coalesce back together.
        for (_, alloc) in std::mem::take(&mut live) {
            heap.free(Some(alloc.addr));
        }
        let stats = heap
            .check()
            .map_err(|e| format!("heap check failed after freeing everything: {e}"))?;
        ensure!(
            stats.allocated_blocks == 0,
            "{} blocks still allocated",
            stats.allocated_blocks,
        );
        ensure!(
            stats.free_blocks <= 1,
            "{} free blocks left uncoalesced",
            stats.free_blocks,
        );

        Ok(())
    }
}

/// A currently-live allocation.
#[derive(Clone, Copy)]
struct LiveAlloc {
    /// The block's payload address.
    addr: Addr,
    /// The requested size; only these bytes are filled and checked.
    size: usize,
    /// The byte every requested byte is filled with.
    pattern: u8,
}

impl LiveAlloc {
    fn new(id: u32, addr: Addr, size: usize) -> Self {
        LiveAlloc {
            addr,
            size,
            pattern: Self::pattern_for(id),
        }
    }

    /// A per-id byte pattern, so that a block overwritten by a neighbor is
    /// caught. Never zero, so that freshly grown memory doesn't pass.
    fn pattern_for(id: u32) -> u8 {
        (id.to_le_bytes().iter().fold(0u8, |acc, b| acc ^ b)) | 0x80
    }

    /// Fill the requested bytes from `from` onwards with our pattern.
    fn fill<G: Arena>(&self, heap: &mut Heap<G>, from: usize) {
        heap.payload_mut(self.addr)[from..self.size].fill(self.pattern);
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc {
            addr,
            size,
            pattern,
        } = self;
        f.debug_struct("LiveAlloc")
            .field("offset", &format!("{:#x}", addr.offset()))
            .field("size", &size)
            .field("pattern", &format!("{pattern:#04x}"))
            .finish()
    }
}
