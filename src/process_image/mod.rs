mod bank;

pub use bank::RegisterBank;

use std::fmt;

use crate::error::BankError;

pub type Coil = bool;
pub type Word = u16;

pub const DEFAULT_HOLDING_REGISTER: Word = 251;
pub const DEFAULT_INPUT_REGISTER: Word = 45;

/// Modbus addresses are 16 bits wide, so no bank holds more than this.
pub const MAX_BANK_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BankKind {
    DiscreteOutputs,
    DiscreteInputs,
    InputRegisters,
    HoldingRegisters,
}

impl fmt::Display for BankKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BankKind::DiscreteOutputs => "discrete outputs",
            BankKind::DiscreteInputs => "discrete inputs",
            BankKind::InputRegisters => "input registers",
            BankKind::HoldingRegisters => "holding registers",
        };
        f.write_str(name)
    }
}

/// How a word bank is populated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSpec {
    /// A single register holding a fixed value.
    Constant(Word),
    /// `count` registers where register `i` holds `i`.
    Sequential(usize),
}

impl RegisterSpec {
    /// `Sequential(count)` when a count was requested, otherwise a single
    /// register with `default`.
    pub fn from_requested(count: Option<usize>, default: Word) -> Self {
        match count {
            Some(count) => RegisterSpec::Sequential(count),
            None => RegisterSpec::Constant(default),
        }
    }

    fn build(self, kind: BankKind) -> RegisterBank<Word> {
        match self {
            RegisterSpec::Constant(value) => RegisterBank::new(kind, 1, |_| value),
            // callers keep count within MAX_BANK_CAPACITY, so the cast is lossless
            RegisterSpec::Sequential(count) => {
                RegisterBank::new(kind, count, |address| address as Word)
            }
        }
    }
}

/// The four banks a slave serves. Built once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessImage {
    discrete_outputs: RegisterBank<Coil>,
    discrete_inputs: RegisterBank<Coil>,
    input_registers: RegisterBank<Word>,
    holding_registers: RegisterBank<Word>,
}

impl ProcessImage {
    pub fn build(
        discrete_out_count: usize,
        discrete_in_count: usize,
        holding: RegisterSpec,
        input: RegisterSpec,
    ) -> Self {
        let alternating = |address: usize| address % 2 == 0;

        Self {
            discrete_outputs: RegisterBank::new(
                BankKind::DiscreteOutputs,
                discrete_out_count,
                alternating,
            ),
            discrete_inputs: RegisterBank::new(
                BankKind::DiscreteInputs,
                discrete_in_count,
                alternating,
            ),
            input_registers: input.build(BankKind::InputRegisters),
            holding_registers: holding.build(BankKind::HoldingRegisters),
        }
    }

    pub fn discrete_outputs(&self) -> &RegisterBank<Coil> {
        &self.discrete_outputs
    }

    pub fn discrete_inputs(&self) -> &RegisterBank<Coil> {
        &self.discrete_inputs
    }

    pub fn input_registers(&self) -> &RegisterBank<Word> {
        &self.input_registers
    }

    pub fn holding_registers(&self) -> &RegisterBank<Word> {
        &self.holding_registers
    }

    pub fn discrete_output(&self, address: usize) -> Result<Coil, BankError> {
        self.discrete_outputs.get(address)
    }

    pub fn discrete_input(&self, address: usize) -> Result<Coil, BankError> {
        self.discrete_inputs.get(address)
    }

    pub fn input_register(&self, address: usize) -> Result<Word, BankError> {
        self.input_registers.get(address)
    }

    pub fn holding_register(&self, address: usize) -> Result<Word, BankError> {
        self.holding_registers.get(address)
    }

    pub fn read_bits(
        &self,
        kind: BankKind,
        address: usize,
        count: usize,
    ) -> Result<Vec<Coil>, BankError> {
        match kind {
            BankKind::DiscreteOutputs => self.discrete_outputs.range(address, count),
            BankKind::DiscreteInputs => self.discrete_inputs.range(address, count),
            BankKind::InputRegisters | BankKind::HoldingRegisters => {
                Err(BankError::OutOfRange {
                    kind,
                    address,
                    capacity: 0,
                })
            }
        }
    }

    pub fn read_words(
        &self,
        kind: BankKind,
        address: usize,
        count: usize,
    ) -> Result<Vec<Word>, BankError> {
        match kind {
            BankKind::InputRegisters => self.input_registers.range(address, count),
            BankKind::HoldingRegisters => self.holding_registers.range(address, count),
            BankKind::DiscreteOutputs | BankKind::DiscreteInputs => Err(BankError::OutOfRange {
                kind,
                address,
                capacity: 0,
            }),
        }
    }
}
