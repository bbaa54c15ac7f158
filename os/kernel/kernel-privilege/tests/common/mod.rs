#![allow(dead_code)]

use kernel_privilege::address::VirtualAddress;
use kernel_privilege::fault::DOUBLE_FAULT_VECTOR;
use kernel_privilege::gate::IdtBuilder;
use kernel_privilege::gdt::{Gdt, KERNEL_CS_SEL, USER_CS_SEL, USER_DS_SEL};
use kernel_privilege::idt::{GateType, Idt};
use kernel_privilege::layout::{DOUBLE_FAULT_IST, IST_STACK_SIZE, KERNEL_STACK_SIZE, SYSCALL_VECTOR};
use kernel_privilege::privilege::Dpl;
use kernel_privilege::sim::Machine;
use kernel_privilege::stack::{KernelStack, PageEntryFlags, PageWalk, RegionMap};
use kernel_privilege::transition::UserEntry;
use kernel_privilege::tss::{TaskState, Tss64};

pub const KSTACK_TOP: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0004_0000);
pub const IST_TOP: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0008_0000);
pub const HANDLERS: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0010_0000);
pub const USER_RIP: VirtualAddress = VirtualAddress::new(0x40_0000);
pub const USER_RSP: VirtualAddress = VirtualAddress::new(0x7FFF_0000);
pub const USER_STACK_SIZE: u64 = 0x4000;
pub const TIMER_VECTOR: u8 = 0x20;

pub type Map = RegionMap<8>;

/// Handler entry points are spaced 16 bytes apart inside one kernel page.
pub fn handler(vector: u8) -> VirtualAddress {
    HANDLERS + u64::from(vector) * 16
}

pub fn address_space() -> Map {
    Map::new()
        .with(
            KSTACK_TOP - KERNEL_STACK_SIZE,
            KERNEL_STACK_SIZE,
            PageWalk::leaf(PageEntryFlags::kernel_data()),
        )
        .and_then(|m| {
            m.with(
                IST_TOP - IST_STACK_SIZE,
                IST_STACK_SIZE,
                PageWalk::leaf(PageEntryFlags::kernel_data()),
            )
        })
        .and_then(|m| m.with(HANDLERS, 0x1000, PageWalk::leaf(PageEntryFlags::kernel_code())))
        .and_then(|m| m.with(USER_RIP, 0x1000, PageWalk::leaf(PageEntryFlags::user_code())))
        .and_then(|m| {
            m.with(
                USER_RSP - USER_STACK_SIZE,
                USER_STACK_SIZE,
                PageWalk::leaf(PageEntryFlags::user_data()),
            )
        })
        .expect("fixture regions do not overlap")
}

/// Exceptions 0..32 and the timer as kernel-only gates, `#DF` on its IST
/// stack, and the system-call gate open to ring 3.
pub fn idt_builder() -> IdtBuilder {
    let mut builder = IdtBuilder::new();
    for vector in 0..32 {
        let gate = if vector == DOUBLE_FAULT_VECTOR {
            builder.handler_with(vector, handler(vector), GateType::InterruptGate, DOUBLE_FAULT_IST)
        } else {
            builder.handler(vector, handler(vector))
        };
        builder = gate.expect("exception gate");
    }
    builder
        .handler(TIMER_VECTOR, handler(TIMER_VECTOR))
        .and_then(|b| {
            b.configure_software_gate(
                SYSCALL_VECTOR,
                handler(SYSCALL_VECTOR),
                KERNEL_CS_SEL,
                Dpl::Ring3,
            )
        })
        .expect("fixture gates")
}

pub struct World {
    pub map: Map,
    pub task: Box<TaskState>,
    pub gdt: Gdt<1>,
    pub idt: Idt,
}

impl World {
    pub fn new() -> Self {
        Self::with_idt(idt_builder().build())
    }

    pub fn with_idt(idt: Idt) -> Self {
        let map = address_space();
        let mut task = Box::new(TaskState::new(0));
        let rsp0 = KernelStack::verify(&map, KSTACK_TOP, KERNEL_STACK_SIZE).expect("rsp0 stack");
        let ist = KernelStack::verify(&map, IST_TOP, IST_STACK_SIZE).expect("IST stack");
        task.set_kernel_stack(&rsp0);
        task.set_ist(DOUBLE_FAULT_IST, &ist).expect("IST slot");
        let gdt = Gdt::<1>::new()
            .with_tss(0, task.base(), Tss64::LIMIT)
            .expect("TSS slot");
        Self { map, task, gdt, idt }
    }

    /// A core in ring 0 on the kernel stack, owning a copy of the address
    /// space so a test can change it.
    pub fn machine(&self) -> Machine<'_, Map, 1> {
        Machine::boot(
            &self.gdt,
            &self.idt,
            &self.task,
            self.map.clone(),
            handler(0),
            KSTACK_TOP,
        )
        .expect("TSS descriptor matches")
    }

    /// A core that has entered user mode at [`USER_RIP`] / [`USER_RSP`].
    pub fn user_machine(&self) -> Machine<'_, Map, 1> {
        let mut machine = self.machine();
        let step = machine.enter_user_mode(&user_entry());
        assert_eq!(step, kernel_privilege::sim::Step::Resumed);
        machine
    }
}

pub fn user_entry() -> UserEntry {
    UserEntry::new(USER_RIP, USER_RSP, USER_CS_SEL, USER_DS_SEL).expect("valid user entry")
}
