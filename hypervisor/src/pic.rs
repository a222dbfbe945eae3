//! Legacy 8259 PIC pair.
//!
//! The cascade is remapped so IRQ vectors do not collide with CPU
//! exceptions: primary lines land at vector 32, secondary at 40. After
//! initialization every line is masked; users unmask exactly what they
//! need.

use {
    log::debug,
    spin::Mutex,
    x86_64::instructions::port::Port,
};

const PRIMARY_COMMAND: u16 = 0x20;
const PRIMARY_DATA: u16 = 0x21;
const SECONDARY_COMMAND: u16 = 0xA0;
const SECONDARY_DATA: u16 = 0xA1;

/// ICW1: initialization with ICW4 to follow.
const ICW1_INIT: u8 = 0x11;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;
/// OCW2: non-specific end of interrupt.
const EOI: u8 = 0x20;

/// Vector offset of the primary PIC.
pub const PRIMARY_VECTOR_OFFSET: u8 = 32;
/// Vector offset of the secondary PIC.
pub const SECONDARY_VECTOR_OFFSET: u8 = PRIMARY_VECTOR_OFFSET + 8;

/// The sixteen legacy IRQ lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IrqLine {
    Timer = 0,
    Keyboard = 1,
    Cascade = 2,
    Com2 = 3,
    Com1 = 4,
    Lpt2 = 5,
    Floppy = 6,
    Lpt1 = 7,
    Rtc = 8,
    Acpi = 9,
    Open1 = 10,
    Open2 = 11,
    Mouse = 12,
    Coprocessor = 13,
    PrimaryAta = 14,
    SecondaryAta = 15,
}

impl IrqLine {
    fn index(self) -> u8 {
        self as u8
    }

    fn is_secondary(self) -> bool {
        self.index() >= 8
    }
}

/// IDT vector an IRQ line is delivered on after remapping.
pub const fn vector(line: IrqLine) -> u8 {
    PRIMARY_VECTOR_OFFSET + line as u8
}

static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new());

/// Run the ICW1..ICW4 initialization sequence on both controllers and mask
/// every line.
pub fn init() {
    let mut pics = PICS.lock();
    unsafe { pics.initialize() };
    debug!(
        "PIC remapped to vectors {}..{}",
        PRIMARY_VECTOR_OFFSET,
        SECONDARY_VECTOR_OFFSET + 8
    );
}

/// Mask (inhibit) a single IRQ line.
pub fn set_mask(line: IrqLine) {
    let mut pics = PICS.lock();
    unsafe { pics.set_mask(line) };
}

/// Unmask a single IRQ line.
pub fn unset_mask(line: IrqLine) {
    let mut pics = PICS.lock();
    unsafe { pics.unset_mask(line) };
}

/// Signal end-of-interrupt for the line. The secondary controller is only
/// acknowledged for its own lines; the primary always is, because the
/// cascade passes through it.
pub fn notify_eoi(line: IrqLine) {
    let mut pics = PICS.lock();
    unsafe { pics.notify_eoi(line) };
}

struct ChainedPics {
    primary_command: Port<u8>,
    primary_data: Port<u8>,
    secondary_command: Port<u8>,
    secondary_data: Port<u8>,
}

impl ChainedPics {
    const fn new() -> Self {
        Self {
            primary_command: Port::new(PRIMARY_COMMAND),
            primary_data: Port::new(PRIMARY_DATA),
            secondary_command: Port::new(SECONDARY_COMMAND),
            secondary_data: Port::new(SECONDARY_DATA),
        }
    }

    unsafe fn initialize(&mut self) {
        // ICW1: begin initialization on both controllers.
        self.primary_command.write(ICW1_INIT);
        self.secondary_command.write(ICW1_INIT);
        // ICW2: vector offsets.
        self.primary_data.write(PRIMARY_VECTOR_OFFSET);
        self.secondary_data.write(SECONDARY_VECTOR_OFFSET);
        // ICW3: secondary hangs off primary line 2.
        self.primary_data.write(0b0000_0100);
        self.secondary_data.write(2);
        // ICW4: 8086 mode.
        self.primary_data.write(ICW4_8086);
        self.secondary_data.write(ICW4_8086);
        // Mask everything until a consumer opts in.
        self.primary_data.write(0xFF);
        self.secondary_data.write(0xFF);
    }

    unsafe fn set_mask(&mut self, line: IrqLine) {
        if line.is_secondary() {
            let current = self.secondary_data.read();
            self.secondary_data.write(masked(current, line.index() - 8));
        } else {
            let current = self.primary_data.read();
            self.primary_data.write(masked(current, line.index()));
        }
    }

    unsafe fn unset_mask(&mut self, line: IrqLine) {
        if line.is_secondary() {
            let current = self.secondary_data.read();
            self.secondary_data.write(unmasked(current, line.index() - 8));
        } else {
            let current = self.primary_data.read();
            self.primary_data.write(unmasked(current, line.index()));
        }
    }

    unsafe fn notify_eoi(&mut self, line: IrqLine) {
        if line.is_secondary() {
            self.secondary_command.write(EOI);
        }
        self.primary_command.write(EOI);
    }
}

/// Mask register value with `bit` inhibited.
fn masked(current: u8, bit: u8) -> u8 {
    current | (1 << bit)
}

/// Mask register value with `bit` enabled.
fn unmasked(current: u8, bit: u8) -> u8 {
    current & !(1 << bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_round_trip_restores_register() {
        let initial = 0b1111_1110;
        let set = masked(initial, IrqLine::Timer as u8);
        assert_eq!(set, 0b1111_1111);
        let cleared = unmasked(set, IrqLine::Timer as u8);
        assert_eq!(cleared & (1 << 0), 0);
        // Unmasking enables the line even if it started masked, so the
        // register is only guaranteed identical when the line was enabled.
        assert_eq!(cleared, initial);
    }

    #[test]
    fn secondary_lines_use_low_three_bits() {
        assert!(IrqLine::SecondaryAta.is_secondary());
        assert!(!IrqLine::Lpt1.is_secondary());
        assert_eq!(vector(IrqLine::Timer), 32);
        assert_eq!(vector(IrqLine::Rtc), 40);
    }
}
