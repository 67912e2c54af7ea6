//! The shared holding-register image.
//!
//! One authoritative copy serves both transports. The image is a cache of the
//! inverter's registers, so mutation is last-writer-wins; the only guard is a
//! per-range reservation that keeps a slow read from clobbering a newer write.

use crate::transaction::{
    InboundException, InboundOp, InboundReply, RegisterOp, RegisterValues, TransactionId,
};
use heapless::{LinearMap, Vec};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Register mirrored between the two gateways.
pub const MIRROR_START: u16 = 0x0000;
pub const MIRROR_COUNT: u16 = 1;

/// Inverter system time, epoch seconds (local time), 2 words.
pub const HR_SYS_TIME: u16 = 0x9C40;
/// Active power limit, 0.1 kW units, 1 word.
pub const HR_ACT_PWR_LIM_VL: u16 = 0x9CB8;
/// Active power output, W, 2 words.
pub const HR_ACT_PWR_OUT: u16 = 0x7D50;

const IMAGE_CAPACITY: usize = 32;
const MAX_BLOCKS: usize = 8;
const MAX_RESERVATIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

impl RegisterBlock {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && u32::from(address) < self.end()
    }

    pub fn overlaps(&self, other: &RegisterBlock) -> bool {
        u32::from(self.start) < other.end() && u32::from(other.start) < self.end()
    }
}

pub const DEFAULT_LAYOUT: [RegisterBlock; 4] = [
    RegisterBlock::new(MIRROR_START, MIRROR_COUNT),
    RegisterBlock::new(HR_SYS_TIME, 2),
    RegisterBlock::new(HR_ACT_PWR_LIM_VL, 1),
    RegisterBlock::new(HR_ACT_PWR_OUT, 2),
];

const fn layout_size(layout: &[RegisterBlock]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < layout.len() {
        total += layout[i].count as usize;
        i += 1;
    }
    total
}

const_assert!(DEFAULT_LAYOUT.len() <= MAX_BLOCKS);
const_assert!(layout_size(&DEFAULT_LAYOUT) <= IMAGE_CAPACITY);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("register {0:#06x} is outside the image layout")]
    IllegalAddress(u16),
    #[error("range {start:#06x}+{count} already has a transaction in flight")]
    RangeBusy { start: u16, count: u16 },
    #[error("too many transactions in flight")]
    ReservationsFull,
    #[error("layout does not fit the image")]
    LayoutTooLarge,
}

#[derive(Debug, Clone)]
struct Reservation {
    id: TransactionId,
    block: RegisterBlock,
    /// Values a write transaction will leave on the device.
    written: Option<RegisterValues>,
    stale: bool,
}

#[derive(Debug)]
pub struct RegisterImage {
    layout: Vec<RegisterBlock, MAX_BLOCKS>,
    values: LinearMap<u16, u16, IMAGE_CAPACITY>,
    reservations: Vec<Reservation, MAX_RESERVATIONS>,
}

impl RegisterImage {
    pub fn new() -> Self {
        let mut image = Self {
            layout: Vec::new(),
            values: LinearMap::new(),
            reservations: Vec::new(),
        };
        // Capacity is checked at compile time above.
        for block in DEFAULT_LAYOUT {
            let _ = image.add_block(block);
        }
        image
    }

    pub fn with_layout(layout: &[RegisterBlock]) -> Result<Self, ImageError> {
        let mut image = Self {
            layout: Vec::new(),
            values: LinearMap::new(),
            reservations: Vec::new(),
        };
        for block in layout {
            image.add_block(*block)?;
        }
        Ok(image)
    }

    fn add_block(&mut self, block: RegisterBlock) -> Result<(), ImageError> {
        self.layout.push(block).map_err(|_| ImageError::LayoutTooLarge)?;
        for offset in 0..block.count {
            let address = block.start.wrapping_add(offset);
            self.values
                .insert(address, 0)
                .map_err(|_| ImageError::LayoutTooLarge)?;
        }
        Ok(())
    }

    pub fn layout(&self) -> &[RegisterBlock] {
        &self.layout
    }

    /// True when every register of the range is part of the layout.
    pub fn covers(&self, start: u16, count: u16) -> bool {
        count > 0
            && (0..count).all(|offset| {
                start
                    .checked_add(offset)
                    .is_some_and(|address| self.values.contains_key(&address))
            })
    }

    pub fn get(&self, address: u16) -> Result<u16, ImageError> {
        self.values
            .get(&address)
            .copied()
            .ok_or(ImageError::IllegalAddress(address))
    }

    /// Immediate local write. No transactional semantics: the value is visible
    /// to the next `get` and to both transports at once.
    pub fn set(&mut self, address: u16, value: u16) -> Result<(), ImageError> {
        let slot = self
            .values
            .get_mut(&address)
            .ok_or(ImageError::IllegalAddress(address))?;
        *slot = value;
        self.mark_stale(RegisterBlock::new(address, 1));
        Ok(())
    }

    pub fn read_range(&self, start: u16, count: u16) -> Result<RegisterValues, ImageError> {
        let mut out = RegisterValues::new();
        for offset in 0..count {
            let address = start
                .checked_add(offset)
                .ok_or(ImageError::IllegalAddress(start))?;
            out.push(self.get(address)?)
                .map_err(|_| ImageError::IllegalAddress(address))?;
        }
        Ok(out)
    }

    /// Write a whole range or nothing.
    pub fn write_range(&mut self, start: u16, values: &[u16]) -> Result<(), ImageError> {
        let count = values.len() as u16;
        if !self.covers(start, count) {
            return Err(ImageError::IllegalAddress(start));
        }
        self.store(start, values);
        self.mark_stale(RegisterBlock::new(start, count));
        Ok(())
    }

    fn store(&mut self, start: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            let address = start.wrapping_add(offset as u16);
            if let Some(slot) = self.values.get_mut(&address) {
                *slot = *value;
            }
        }
    }

    fn mark_stale(&mut self, block: RegisterBlock) {
        for reservation in self.reservations.iter_mut() {
            if reservation.block.overlaps(&block) {
                reservation.stale = true;
            }
        }
    }

    /// Claim the range of an outgoing transaction. Ranges outside the layout
    /// have nothing to protect and are not tracked.
    pub fn reserve(&mut self, id: TransactionId, op: &RegisterOp) -> Result<(), ImageError> {
        let block = RegisterBlock::new(op.address(), op.count());
        if !self.covers(block.start, block.count) {
            return Ok(());
        }
        if self.reservations.iter().any(|r| r.block.overlaps(&block)) {
            return Err(ImageError::RangeBusy {
                start: block.start,
                count: block.count,
            });
        }
        let written = match op {
            RegisterOp::Write { values, .. } => Some(values.clone()),
            RegisterOp::Read { .. } => None,
        };
        self.reservations
            .push(Reservation {
                id,
                block,
                written,
                stale: false,
            })
            .map_err(|_| ImageError::ReservationsFull)
    }

    /// Settle a successful transaction. Returns true when the image was updated;
    /// a range written locally while the transaction was in flight keeps the
    /// newer value.
    pub fn complete(&mut self, id: TransactionId, read_values: &[u16]) -> bool {
        let Some(index) = self.reservations.iter().position(|r| r.id == id) else {
            return false;
        };
        let reservation = self.reservations.swap_remove(index);
        if reservation.stale {
            return false;
        }
        match reservation.written {
            Some(values) => self.store(reservation.block.start, &values),
            None if read_values.len() == reservation.block.count as usize => {
                self.store(reservation.block.start, read_values);
            }
            None => return false,
        }
        true
    }

    /// Drop a reservation without touching the image.
    pub fn release(&mut self, id: TransactionId) {
        self.reservations.retain(|r| r.id != id);
    }

    pub fn in_flight(&self) -> usize {
        self.reservations.len()
    }

    /// Answer a request from a remote controller.
    pub fn serve(&mut self, op: &InboundOp) -> InboundReply {
        match op {
            InboundOp::Read { address, count } => {
                if *count == 0 || usize::from(*count) > crate::transaction::MAX_TX_REGISTERS {
                    return InboundReply::Exception(InboundException::IllegalDataValue);
                }
                match self.read_range(*address, *count) {
                    Ok(values) => InboundReply::Registers(values),
                    Err(_) => InboundReply::Exception(InboundException::IllegalDataAddress),
                }
            }
            InboundOp::Write { address, values } => {
                if values.is_empty() {
                    return InboundReply::Exception(InboundException::IllegalDataValue);
                }
                match self.write_range(*address, values) {
                    Ok(()) => InboundReply::Written {
                        address: *address,
                        count: values.len() as u16,
                    },
                    Err(_) => InboundReply::Exception(InboundException::IllegalDataAddress),
                }
            }
        }
    }
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new()
    }
}
