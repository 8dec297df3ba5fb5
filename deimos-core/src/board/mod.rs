//! Provides a generic virt-style board: one RV64 core plus the platform plumbing a guest
//! kernel expects to boot.

use crate::address_map::{MemoryMap, MemoryMapBuilder, MemoryMapError};
use crate::core::{Config as CoreConfig, Core, Interrupt};
use crate::decoder::{Decoder, DecoderError};
use crate::interrupt::MipWire;
use crate::resources::clint::{self, Clint};
use crate::resources::plic::{self, Plic};
use crate::resources::ram::Ram;
use crate::resources::rom::Rom;
use crate::resources::syscon::{self, PowerEvent, PowerLatch, Syscon};
use log::info;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

/// Fixed platform memory layout.
pub mod layout {
    /// Boot flash: holds the reset stub and its literal pool.
    pub const BOOT_ROM_BASE: u64 = 0x1000;
    pub const BOOT_ROM_SIZE: u64 = 0xF000;
    /// System controller (reset/poweroff word).
    pub const SYSCON_BASE: u64 = 0x0100_0000;
    /// Core-local interruptor.
    pub const CLINT_BASE: u64 = 0x0200_0000;
    /// Platform-level interrupt controller.
    pub const PLIC_BASE: u64 = 0x0C00_0000;
    /// Start of physical memory.
    pub const RAM_BASE: u64 = 0x8000_0000;
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of main memory in bytes.
    pub ram_size: usize,
    /// Firmware payload (e.g. OpenSBI with a Linux payload), loaded at the start of RAM.
    pub firmware: Vec<u8>,
    /// Flattened device tree blob, placed at the top of RAM; its address is handed to the
    /// firmware in `a1` by the boot stub.
    pub dtb: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ram_size: 128 << 20,
            firmware: Vec::new(),
            dtb: Vec::new(),
        }
    }
}

/// Result of a [`Board::run`] call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunResult {
    /// The instruction budget was exhausted; call `run` again to continue.
    BudgetExhausted,
    /// The guest requested poweroff through the system controller.
    PoweredOff,
}

/// RISC-V hardware platform: a single core wired to RAM, boot flash, the CLINT, the PLIC, and
/// the system controller, through a shared memory map.
///
/// > A RISC-V hardware platform can contain one or more RISC-V-compatible processing cores
/// > together with other non-RISC-V-compatible cores, fixed-function accelerators, various
/// > physical memory structures, I/O devices, and an interconnect structure to allow the
/// > components to communicate.
///
/// Concrete MMIO device bodies (UART, VirtIO, RTC, ...) are registered by the embedder in the
/// device band of the [`MemoryMapBuilder`] before the board is built; their interrupt lines go
/// through [`Board::plic`].
#[derive(Debug)]
pub struct Board {
    /// The single core of this board. Multiprocessing is not supported.
    core: Core<Rc<MemoryMap>>,
    system_bus: Rc<MemoryMap>,
    boot_rom: Rc<Rom>,
    ram: Rc<Ram>,
    clint: Rc<Clint>,
    plic: Rc<Plic>,
    power: Arc<PowerLatch>,
    dtb_address: u64,
}

impl Board {
    pub fn new(config: Config) -> Result<Self, BoardError> {
        Self::with_devices(config, |_| Ok(()))
    }

    /// Build a board, letting `register_devices` place additional MMIO resources (UART,
    /// VirtIO, ...) in the map before it is frozen.
    pub fn with_devices(
        config: Config,
        register_devices: impl FnOnce(&mut MemoryMapBuilder) -> Result<(), MemoryMapError>,
    ) -> Result<Self, BoardError> {
        let decoder = Decoder::new()?;
        let wires = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let wire = |bit: u64| MipWire::new(Arc::clone(&wires), bit as u32).into_dyn();

        let power = PowerLatch::new();
        let syscon = Rc::new(Syscon::new(Arc::clone(&power)));
        let clint = Rc::new(Clint::new(
            wire(Interrupt::MACHINE_SOFTWARE),
            wire(Interrupt::MACHINE_TIMER),
        ));
        let plic = Rc::new(Plic::new(
            wire(Interrupt::MACHINE_EXTERNAL),
            wire(Interrupt::SUPERVISOR_EXTERNAL),
        ));
        let boot_rom = Rc::new(
            Rom::new(layout::BOOT_ROM_SIZE as usize, &[]).expect("boot ROM size is non-zero"),
        );
        let ram = Rc::new(Ram::new(config.ram_size).ok_or(BoardError::NoRam)?);

        // The DTB lives at the top of RAM, doubleword-aligned.
        let dtb_offset = config
            .ram_size
            .checked_sub(config.dtb.len())
            .ok_or(BoardError::ImageTooLarge)?
            & !0xF;
        let dtb_address = layout::RAM_BASE + dtb_offset as u64;
        if config.firmware.len() > dtb_offset {
            return Err(BoardError::ImageTooLarge);
        }
        ram.write_range(0, &config.firmware);
        ram.write_range(dtb_offset as u64, &config.dtb);

        let mut builder = MemoryMapBuilder::new();
        builder.add_at(
            layout::BOOT_ROM_BASE,
            layout::BOOT_ROM_SIZE,
            Rc::clone(&boot_rom) as Rc<dyn crate::bus::Bus>,
        )?;
        builder.add_at(layout::SYSCON_BASE, syscon::SIZE, Rc::clone(&syscon) as _)?;
        builder.add_at(layout::CLINT_BASE, clint::SIZE, Rc::clone(&clint) as _)?;
        builder.add_at(layout::PLIC_BASE, plic::SIZE, Rc::clone(&plic) as _)?;
        builder.add_at(
            layout::RAM_BASE,
            config.ram_size as u64,
            Rc::clone(&ram) as _,
        )?;
        register_devices(&mut builder)?;
        let system_bus = Rc::new(builder.build());

        let core = Core::with_interrupt_wires(
            Rc::clone(&system_bus),
            decoder,
            CoreConfig {
                // At least one hart must have ID 0 according to the spec.
                hart_id: 0,
                mtime_address: layout::CLINT_BASE + clint::MTIME_ADDR_LO,
                reset_vector: layout::BOOT_ROM_BASE,
            },
            wires,
        );

        Ok(Self {
            core,
            system_bus,
            boot_rom,
            ram,
            clint,
            plic,
            power,
            dtb_address,
        })
    }

    /// Program the boot stub. Must be called once after construction, before stepping.
    ///
    /// The stub loads the DTB address into `a1`, the firmware entry point into `t0`, and jumps
    /// there; the two addresses live in a literal pool right behind the code.
    pub fn initialize(&self, entry_address: u64) {
        info!(
            entry_address, dtb_address = self.dtb_address;
            "Programming boot stub"
        );
        let mut stub = Vec::with_capacity(32);
        for word in [
            0x0000_0297u32, // auipc t0, 0
            0x0102_B583,    // ld    a1, 16(t0)
            0x0182_B283,    // ld    t0, 24(t0)
            0x0002_8067,    // jalr  x0, t0, 0
        ] {
            stub.extend_from_slice(&word.to_le_bytes());
        }
        stub.extend_from_slice(&self.dtb_address.to_le_bytes());
        stub.extend_from_slice(&entry_address.to_le_bytes());
        self.boot_rom.load(0, &stub);
    }

    /// Execute up to `budget` instructions.
    ///
    /// Returns early when the guest powers the system off; a guest-requested reset re-enters
    /// the reset vector and keeps running. This is the only entry point that advances emulated
    /// time, and it must not be called re-entrantly.
    pub fn run(&mut self, budget: u64) -> RunResult {
        for _ in 0..budget {
            self.core.step();
            self.clint.tick(1);
            match self.power.take() {
                Some(PowerEvent::Reset) => {
                    info!("Guest requested system reset");
                    self.reset();
                }
                Some(PowerEvent::PowerOff) => {
                    info!("Guest requested system poweroff");
                    return RunResult::PoweredOff;
                }
                None => {}
            }
        }
        RunResult::BudgetExhausted
    }

    /// Force the board back to its reset state. RAM contents are preserved.
    pub fn reset(&mut self) {
        self.core.reset();
        self.clint.reset();
        self.plic.reset();
    }

    /// Write a byte buffer into physical memory.
    ///
    /// Bytes outside RAM are ignored; this is a host-side loader, not a bus access.
    pub fn load_physical(&self, base_address: u64, buf: &[u8]) {
        let Some(offset) = base_address.checked_sub(layout::RAM_BASE) else {
            return;
        };
        self.ram.write_range(offset, buf);
    }

    pub fn core(&self) -> &Core<Rc<MemoryMap>> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core<Rc<MemoryMap>> {
        &mut self.core
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.system_bus
    }

    pub fn clint(&self) -> &Clint {
        &self.clint
    }

    pub fn plic(&self) -> &Rc<Plic> {
        &self.plic
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    /// The physical address the DTB was placed at.
    pub fn dtb_address(&self) -> u64 {
        self.dtb_address
    }
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("failed to build instruction decoder: {0}")]
    Decoder(#[from] DecoderError),
    #[error("failed to build memory map: {0}")]
    MemoryMap(#[from] MemoryMapError),
    #[error("RAM size must be non-zero")]
    NoRam,
    #[error("firmware/dtb images don't fit in RAM")]
    ImageTooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::core::csr;
    use crate::registers::Specifier;
    use crate::system_bus::SystemBus;
    use crate::PrivilegeLevel;

    fn x(index: u8) -> Specifier {
        Specifier::new(index).unwrap()
    }

    fn start_at(board: &mut Board, address: u64) {
        *board.core_mut().registers_mut().pc_mut() = address;
    }

    /// Poweroff sequence: writes 0x7777 to the system controller.
    const POWEROFF: [u32; 5] = [
        0x0100_0237, // lui  x4, 0x1000      ; x4 = 0x0100_0000
        0x0000_72B7, // lui  x5, 0x7         ; x5 = 0x7000
        0x7772_8293, // addi x5, x5, 0x777   ; x5 = 0x7777
        0x0052_2023, // sw   x5, 0(x4)
        0x0000_006F, // jal  x0, 0
    ];

    #[test]
    fn test_boot_stub() {
        let mut board = Board::new(Config {
            dtb: vec![0xD7; 64],
            ..Config::default()
        })
        .unwrap();
        // Target program: poweroff immediately.
        let bytes: Vec<u8> = POWEROFF.iter().flat_map(|w| w.to_le_bytes()).collect();
        board.load_physical(layout::RAM_BASE, &bytes);
        board.initialize(layout::RAM_BASE);
        assert_eq!(RunResult::PoweredOff, board.run(100));
        // The stub handed the DTB pointer to a1 before jumping to the entry point.
        let core = board.core();
        assert_eq!(board.dtb_address(), core.registers().x(x(11)));
    }

    #[test]
    fn test_addw_sign_extension() {
        // Scenario: 0x7FFF_FFFF + 1 wraps to the negative 32-bit range; ADDW sign-extends,
        // ADD does not.
        let mut board = Board::new(Config::default()).unwrap();
        start_at(&mut board, layout::RAM_BASE);
        let core = board.core_mut();
        core.registers_mut().set_x(x(1), 1);
        core.registers_mut().set_x(x(5), 0x7FFF_FFFF);
        core.registers_mut().set_x(x(6), 0x7FFF_FFFF);
        core.step_with_raw(0x0012_82BB); // addw x5, x5, x1
        assert_eq!(0xFFFF_FFFF_8000_0000, core.registers().x(x(5)));
        core.step_with_raw(0x0013_02B3); // add x5, x6, x1
        assert_eq!(0x8000_0000, core.registers().x(x(5)));
    }

    #[test]
    fn test_ecall_delegation_from_u_mode() {
        // Scenario: with medeleg[8] set, an ECALL from U-mode lands in the S-mode handler
        // with scause=8, sepc = the ECALL's pc, stval=0.
        let mut program = vec![0x0000_0013u32; 32]; // nop padding
        program[0] = 0x1000_0093; // addi  x1, x0, 256       ; medeleg bit 8
        program[1] = 0x3020_9073; // csrrw x0, medeleg, x1
        program[2] = 0x0000_0117; // auipc x2, 0             ; x2 = base+0x08
        program[3] = 0x0781_0113; // addi  x2, x2, 0x78      ; x2 = base+0x80
        program[4] = 0x1051_1073; // csrrw x0, stvec, x2
        program[5] = 0x0000_0197; // auipc x3, 0             ; x3 = base+0x14
        program[6] = 0x01C1_8193; // addi  x3, x3, 28        ; x3 = base+0x30
        program[7] = 0x3411_9073; // csrrw x0, mepc, x3
        program[8] = 0x3020_0073; // mret                    ; to U-mode at base+0x30
        program[12] = 0x0000_0073; // ecall
        let mut full = program;
        full.extend_from_slice(&POWEROFF); // S-mode handler at base+0x80
        let bytes: Vec<u8> = full.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut board = Board::new(Config::default()).unwrap();
        board.load_physical(layout::RAM_BASE, &bytes);
        start_at(&mut board, layout::RAM_BASE);
        assert_eq!(RunResult::PoweredOff, board.run(1000));
        let core = board.core_mut();
        assert_eq!(PrivilegeLevel::Supervisor, core.privilege_mode());
        assert_eq!(
            8,
            core.read_csr(csr::SCAUSE, PrivilegeLevel::Machine).unwrap()
        );
        assert_eq!(
            layout::RAM_BASE + 0x30,
            core.read_csr(csr::SEPC, PrivilegeLevel::Machine).unwrap()
        );
        assert_eq!(
            0,
            core.read_csr(csr::STVAL, PrivilegeLevel::Machine).unwrap()
        );
    }

    #[test]
    fn test_load_page_fault_on_empty_root() {
        // Scenario: Sv39 with an all-zero root table; a load from 0x1000_0000 in S-mode
        // raises a load page fault with stval = the virtual address.
        let mut board = Board::new(Config::default()).unwrap();
        start_at(&mut board, layout::RAM_BASE);
        let core = board.core_mut();
        let m = PrivilegeLevel::Machine;
        // Root page table at 0x8010_0000 (zeroed RAM).
        core.write_csr(csr::SATP, m, 8 << 60 | 0x80100, u64::MAX)
            .unwrap();
        core.write_csr(csr::MEDELEG, m, 1 << 13, u64::MAX).unwrap();
        core.write_csr(csr::MEPC, m, layout::RAM_BASE, u64::MAX)
            .unwrap();
        // MPP = S, then return into S-mode.
        core.write_csr(csr::MSTATUS, m, 0b01 << 11, 0b11 << 11)
            .unwrap();
        core.step_with_raw(0x3020_0073); // mret
        assert_eq!(PrivilegeLevel::Supervisor, core.privilege_mode());
        core.registers_mut().set_x(x(6), 0x1000_0000);
        core.step_with_raw(0x0003_2283); // lw x5, 0(x6)
        assert_eq!(13, core.read_csr(csr::SCAUSE, m).unwrap());
        assert_eq!(0x1000_0000, core.read_csr(csr::STVAL, m).unwrap());
        assert_eq!(layout::RAM_BASE, core.read_csr(csr::SEPC, m).unwrap());
    }

    #[test]
    fn test_sv39_translation_and_sfence() {
        // Map VA 0x1000 -> PA 0x8000_2000 through a three-level table, then check that
        // SFENCE.VMA forces a re-walk after the leaf PTE changes.
        let board = Board::new(Config::default()).unwrap();
        let root = 0x8010_0000u64;
        let mid = 0x8010_1000u64;
        let leaf_table = 0x8010_2000u64;
        let pte = |pa: u64, flags: u64| (pa >> 12 << 10) | flags;
        board.load_physical(root, &pte(mid, 0b1).to_le_bytes());
        board.load_physical(mid, &pte(leaf_table, 0b1).to_le_bytes());
        // Leaf for vpn0=1: V|R|W|A|D.
        board.load_physical(leaf_table + 8, &pte(0x8000_2000, 0xC7).to_le_bytes());
        board.load_physical(0x8000_2000, &0x5566_7788u32.to_le_bytes());
        board.load_physical(0x8000_3000, &0x0EFF_0011u32.to_le_bytes());

        let mut board = board;
        let core = board.core_mut();
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::SATP, m, 8 << 60 | (root >> 12), u64::MAX)
            .unwrap();
        // MPRV=1 with MPP=S: loads translate as S-mode while staying in M-mode.
        core.write_csr(csr::MSTATUS, m, 1 << 17 | 0b01 << 11, 1 << 17 | 0b11 << 11)
            .unwrap();
        core.registers_mut().set_x(x(6), 0x1000);
        core.step_with_raw(0x0003_2283); // lw x5, 0(x6)
        assert_eq!(0x5566_7788, core.registers().x(x(5)));
        // Repoint the leaf to 0x8000_3000; the stale translation is still cached.
        board.load_physical(leaf_table + 8, &(0x8000_3000u64 >> 12 << 10 | 0xC7).to_le_bytes());
        let core = board.core_mut();
        core.step_with_raw(0x0003_2283);
        assert_eq!(0x5566_7788, core.registers().x(x(5)));
        // SFENCE.VMA x0, x0 flushes; the next access re-walks.
        core.step_with_raw(0x1200_0073);
        core.step_with_raw(0x0003_2283);
        assert_eq!(0x0EFF_0011, core.registers().x(x(5)));
    }

    #[test]
    fn test_lr_sc() {
        // Scenario: LR/SC success path, and failure after an intervening store.
        let mut board = Board::new(Config::default()).unwrap();
        board.load_physical(layout::RAM_BASE, &0xAAu64.to_le_bytes());
        start_at(&mut board, layout::RAM_BASE + 0x100);
        let core = board.core_mut();
        core.registers_mut().set_x(x(2), layout::RAM_BASE);
        core.registers_mut().set_x(x(4), 0x55);
        core.step_with_raw(0x1001_30AF); // lr.d x1, (x2)
        assert_eq!(0xAA, core.registers().x(x(1)));
        core.step_with_raw(0x1841_31AF); // sc.d x3, x4, (x2)
        assert_eq!(0, core.registers().x(x(3)));
        assert_eq!(
            0x55,
            board.memory_map().read(layout::RAM_BASE, crate::bus::AccessWidth::Doubleword)
        );
        // Second SC without a reservation fails.
        let core = board.core_mut();
        core.step_with_raw(0x1841_31AF);
        assert_eq!(1, core.registers().x(x(3)));
        // An intervening store to the granule kills the reservation.
        core.step_with_raw(0x1001_30AF); // lr.d x1, (x2)
        core.step_with_raw(0x0041_3023); // sd x4, 0(x2)
        core.step_with_raw(0x1841_31AF); // sc.d x3, x4, (x2)
        assert_eq!(1, core.registers().x(x(3)));
        // So does any AMO, even one whose address doesn't overlap the granule.
        core.registers_mut().set_x(x(5), layout::RAM_BASE + 0x40);
        core.step_with_raw(0x1001_30AF); // lr.d x1, (x2)
        core.step_with_raw(0x0042_B02F); // amoadd.d x0, x4, (x5)
        core.step_with_raw(0x1841_31AF); // sc.d x3, x4, (x2)
        assert_eq!(1, core.registers().x(x(3)));
    }

    #[test]
    fn test_clint_timer_interrupt() {
        // Scenario: arm mtimecmp 100 ticks out, enable MTIE+MIE, and spin; the timer
        // interrupt must vector to mtvec with mcause = interrupt|7 and mepc = the loop pc.
        let mut full = vec![0x0000_0013u32; 16];
        full[0] = 0x0000_006F; // jal x0, 0 (spin)
        full.extend_from_slice(&POWEROFF); // handler at base+0x40
        let bytes: Vec<u8> = full.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut board = Board::new(Config::default()).unwrap();
        board.load_physical(layout::RAM_BASE, &bytes);
        start_at(&mut board, layout::RAM_BASE);
        let deadline = board.clint().mtime() + 100;
        board.clint().write(
            clint::MTIMECMP_ADDR_LO,
            crate::bus::AccessWidth::Doubleword,
            deadline,
        );
        let core = board.core_mut();
        let m = PrivilegeLevel::Machine;
        core.write_csr(csr::MTVEC, m, layout::RAM_BASE + 0x40, u64::MAX)
            .unwrap();
        core.write_csr(csr::MIE, m, 1 << 7, u64::MAX).unwrap();
        core.write_csr(csr::MSTATUS, m, 1 << 3, 1 << 3).unwrap();
        assert_eq!(RunResult::PoweredOff, board.run(10_000));
        let core = board.core_mut();
        assert_eq!(
            1 << 63 | 7,
            core.read_csr(csr::MCAUSE, m).unwrap()
        );
        assert_eq!(layout::RAM_BASE, core.read_csr(csr::MEPC, m).unwrap());
    }

    #[test]
    fn test_compressed_execution() {
        // Scenario: C.ADDI executes as ADDI with the pc advancing by 2.
        let mut board = Board::new(Config::default()).unwrap();
        board.load_physical(layout::RAM_BASE, &[0x05, 0x04, 0x09, 0x04]); // c.addi x8,1; c.addi x8,2
        start_at(&mut board, layout::RAM_BASE);
        let core = board.core_mut();
        core.registers_mut().set_x(x(8), 5);
        core.step();
        assert_eq!(6, core.registers().x(x(8)));
        assert_eq!(layout::RAM_BASE + 2, core.registers().pc());
        core.step();
        assert_eq!(8, core.registers().x(x(8)));
        assert_eq!(layout::RAM_BASE + 4, core.registers().pc());
    }

    #[test]
    fn test_wfi_parks_until_interrupt() {
        let mut board = Board::new(Config::default()).unwrap();
        let bytes: Vec<u8> = [0x1050_0073u32, 0x0000_0013, 0x0000_0013, 0x0000_0013]
            .iter() // wfi; nop; nop; nop
            .flat_map(|w| w.to_le_bytes())
            .collect();
        board.load_physical(layout::RAM_BASE, &bytes);
        start_at(&mut board, layout::RAM_BASE);
        let core = board.core_mut();
        core.write_csr(csr::MIE, PrivilegeLevel::Machine, 1 << 3, u64::MAX)
            .unwrap();
        // MIE (global) stays off: WFI must still wake on a pending-enabled interrupt, which
        // then is *not* taken as a trap.
        board.run(10);
        assert!(board.core().is_waiting_for_interrupt());
        let pc_parked = board.core().registers().pc();
        // Raise MSIP through the CLINT.
        board
            .clint()
            .write(clint::MSIP_ADDR, crate::bus::AccessWidth::Word, 1);
        board.run(1);
        assert!(!board.core().is_waiting_for_interrupt());
        // The hart resumed sequentially (no trap was delivered).
        assert_eq!(pc_parked + 4, board.core().registers().pc());
    }

    #[test]
    fn test_guest_reset_reenters_reset_vector() {
        let mut board = Board::new(Config::default()).unwrap();
        // Write 0x5555 to the syscon, then spin.
        let program = [
            0x0100_0237u32, // lui  x4, 0x1000
            0x0000_52B7,    // lui  x5, 0x5
            0x5552_8293,    // addi x5, x5, 0x555
            0x0052_2023,    // sw   x5, 0(x4)
            0x0000_006F,    // jal  x0, 0
        ];
        let bytes: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        board.load_physical(layout::RAM_BASE, &bytes);
        board.initialize(layout::RAM_BASE);
        assert_eq!(RunResult::BudgetExhausted, board.run(20));
        // After the reset the core is back at the boot ROM reset vector (and has made
        // progress through the stub again).
        let pc = board.core().registers().pc();
        assert!(
            (layout::BOOT_ROM_BASE..layout::RAM_BASE + 0x10).contains(&pc),
            "pc after reset: {pc:#x}"
        );
        assert_eq!(PrivilegeLevel::Machine, board.core().privilege_mode());
    }
}
