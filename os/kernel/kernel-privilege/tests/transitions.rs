mod common;

use common::{
    HANDLERS, IST_TOP, KSTACK_TOP, TIMER_VECTOR, USER_RIP, USER_RSP, World, handler, user_entry,
};
use kernel_privilege::address::VirtualAddress;
use kernel_privilege::fault::{
    DOUBLE_FAULT_VECTOR, Fault, GENERAL_PROTECTION_VECTOR, PAGE_FAULT_VECTOR, PageFaultError,
    SEGMENT_NOT_PRESENT_VECTOR, SelectorErrorCode,
};
use kernel_privilege::frame::InterruptFrame;
use kernel_privilege::gdt::descriptors::SegmentDescriptor;
use kernel_privilege::gdt::{KERNEL_CS, SegmentSlot, USER_CS, USER_DS};
use kernel_privilege::idt::{GateType, Ist};
use kernel_privilege::layout::{IST_STACK_SIZE, KERNEL_STACK_SIZE};
use kernel_privilege::privilege::{Dpl, Ring};
use kernel_privilege::sim::{CpuState, Machine, Source, Step};
use kernel_privilege::stack::{PageEntryFlags, PageWalk};
use kernel_privilege::transition::UserEntry;
use kernel_registers::{CodeSegment, Rflags, StackSegment};

fn user_frame() -> InterruptFrame {
    InterruptFrame::new(USER_RIP, USER_CS, Rflags::user_mode_entry(), USER_RSP, USER_DS)
}

#[test]
fn enter_user_mode_loads_the_requested_context() {
    let world = World::new();
    let mut m = world.machine();
    assert_eq!(m.cpl(), Ring::Ring0);

    assert_eq!(m.enter_user_mode(&user_entry()), Step::Resumed);
    assert_eq!(
        *m.state(),
        CpuState {
            rip: VirtualAddress::new(0x40_0000),
            rsp: VirtualAddress::new(0x7FFF_0000),
            rflags: Rflags::from_bits(0x202),
            cs: CodeSegment(0x1B),
            ss: StackSegment(0x23),
        }
    );
    assert_eq!(m.cpl(), Ring::Ring3);
    assert_eq!(m.depth(), 0);
}

#[test]
fn entered_context_is_consistent_and_usable() {
    let world = World::new();
    let mut m = world.user_machine();

    let state = *m.state();
    assert_eq!(state.cs.cpl(), 3);
    assert_eq!(state.ss.rpl(), 3);

    assert_eq!(m.fetch(), Step::Resumed);
    assert_eq!(m.push_user_stack(), Step::Resumed);
    assert_eq!(m.state().rsp, USER_RSP - 8);
}

#[test]
fn hardware_interrupt_round_trip() {
    let world = World::new();
    let mut m = world.user_machine();
    let before = *m.state();

    let step = m.hardware_interrupt(TIMER_VECTOR);
    let Step::Entered(delivery) = step else {
        panic!("timer not delivered: {step:?}");
    };
    assert_eq!(delivery.source, Source::Hardware);
    assert_eq!(delivery.frame, user_frame());
    assert!(delivery.frame.rflags().if_interrupt_enable());
    assert_eq!(delivery.error_code, None);
    assert_eq!(delivery.stack_pointer, KSTACK_TOP - 40);

    // Handler runs in ring 0 on rsp0 with a null stack selector.
    let handler_state = *m.state();
    assert_eq!(handler_state.rip, handler(TIMER_VECTOR));
    assert_eq!(handler_state.cs, CodeSegment(KERNEL_CS));
    assert_eq!(handler_state.ss, StackSegment(0));
    assert_eq!(handler_state.rsp, KSTACK_TOP - 40);
    assert!(!handler_state.rflags.if_interrupt_enable());

    assert_eq!(m.iret(), Step::Resumed);
    assert_eq!(*m.state(), before);
    assert_eq!(m.depth(), 0);
}

#[test]
fn nested_events_unwind_in_order() {
    let world = World::new();
    let mut m = world.user_machine();
    let user = *m.state();

    assert!(matches!(m.hardware_interrupt(TIMER_VECTOR), Step::Entered(_)));
    let in_timer = *m.state();

    // A fault inside the handler stays on the current kernel stack.
    let step = m.exception(PAGE_FAULT_VECTOR, 0x2);
    let delivery = step.delivery().copied().expect("page fault delivered");
    assert_eq!(delivery.error_code, Some(0x2));
    assert_eq!(delivery.frame, in_timer.frame());
    assert_eq!(delivery.stack_pointer, KSTACK_TOP - 96);
    assert_eq!(m.state().ss, StackSegment(0));

    let vectors: Vec<u8> = m.frames().map(|d| d.vector).collect();
    assert_eq!(vectors, [TIMER_VECTOR, PAGE_FAULT_VECTOR]);

    assert_eq!(m.iret(), Step::Resumed);
    assert_eq!(*m.state(), in_timer);
    assert_eq!(m.depth(), 1);

    assert_eq!(m.iret(), Step::Resumed);
    assert_eq!(*m.state(), user);
    assert_eq!(m.depth(), 0);
}

#[test]
fn non_present_user_code_segment_raises_np_and_keeps_state() {
    let world = World::new();
    let gdt = world.gdt.clone().with_segment(
        SegmentSlot::UserCode,
        SegmentDescriptor::code64(Dpl::Ring3).with_present(false),
    );
    let mut m = Machine::boot(
        &gdt,
        &world.idt,
        &world.task,
        world.map.clone(),
        handler(0),
        KSTACK_TOP,
    )
    .expect("boot");
    let before = *m.state();

    let step = m.enter_user_mode(&user_entry());
    assert_eq!(
        step.fault(),
        Some(Fault::SegmentNotPresent {
            error: SelectorErrorCode::for_selector(USER_CS),
        })
    );
    let delivery = step.delivery().expect("#NP delivered");
    assert_eq!(delivery.vector, SEGMENT_NOT_PRESENT_VECTOR);
    assert_eq!(delivery.error_code, Some(0x18));
    assert_eq!(delivery.frame, before.frame());
    assert_eq!(m.cpl(), Ring::Ring0);
    assert_eq!(m.state().rip, handler(SEGMENT_NOT_PRESENT_VECTOR));
}

#[test]
fn non_canonical_return_address_is_refused() {
    let world = World::new();
    let mut m = world.machine();
    let frame = InterruptFrame::new(
        VirtualAddress::new(0x0000_8000_0000_0000),
        USER_CS,
        Rflags::user_mode_entry(),
        USER_RSP,
        USER_DS,
    );
    let step = m.return_from_interrupt(&frame);
    assert_eq!(step.fault(), Some(Fault::gp_selector(0)));
    assert_eq!(m.cpl(), Ring::Ring0);
}

#[test]
fn ring0_iretq_loads_frame_flags_minus_reserved_bits() {
    let world = World::new();
    let mut m = world.machine();
    // IOPL 3 and TF survive; reserved bit 3 is cleared.
    let frame = InterruptFrame {
        rflags: 0x3000 | 0x100 | 0x8 | 0x202,
        ..user_frame()
    };
    assert_eq!(m.return_from_interrupt(&frame), Step::Resumed);
    assert_eq!(m.state().rflags.into_bits(), 0x3302);

    // Once in ring 3, an iretq cannot change IF or IOPL.
    let frame = InterruptFrame {
        rflags: 0x2,
        ..user_frame()
    };
    assert_eq!(m.return_from_interrupt(&frame), Step::Resumed);
    assert_eq!(m.state().rflags.into_bits(), 0x3202);
}

#[test]
fn user_mode_cannot_mask_interrupts() {
    let world = World::new();
    let mut m = world.user_machine();
    let step = m.set_interrupts(false);
    assert_eq!(step.fault(), Some(Fault::gp_selector(0)));
    let delivery = step.delivery().expect("#GP delivered");
    assert_eq!(delivery.vector, GENERAL_PROTECTION_VECTOR);
    assert_eq!(delivery.frame, user_frame());
}

#[test]
fn iret_without_a_frame_faults() {
    let world = World::new();
    let mut m = world.machine();
    assert_eq!(m.iret().fault(), Some(Fault::gp_selector(0)));
}

#[test]
fn non_executable_entry_point_faults_on_first_fetch() {
    let world = World::new();
    let mut m = world.user_machine();
    assert!(m.view_mut().unmap(USER_RIP));
    m.view_mut()
        .map(USER_RIP, 0x1000, PageWalk::leaf(PageEntryFlags::user_data()))
        .expect("remapped");

    let step = m.fetch();
    assert_eq!(
        step.fault(),
        Some(Fault::PageFault {
            address: USER_RIP,
            error: PageFaultError::from_bits(0x15),
        })
    );
    let delivery = step.delivery().expect("#PF delivered");
    assert_eq!(delivery.error_code, Some(0x15));
    assert_eq!(delivery.stack_pointer, KSTACK_TOP - 48);
    assert_eq!(delivery.frame, user_frame());
}

#[test]
fn invalid_user_stack_faults_on_first_access() {
    let world = World::new();
    let mut m = world.machine();
    let rsp = VirtualAddress::new(0x6000_0000);
    let entry = UserEntry::from_raw(USER_RIP, rsp, USER_CS, USER_DS).expect("valid entry");

    // iretq never touches the new stack.
    assert_eq!(m.enter_user_mode(&entry), Step::Resumed);
    assert_eq!(m.fetch(), Step::Resumed);

    let step = m.push_user_stack();
    assert_eq!(
        step.fault(),
        Some(Fault::PageFault {
            address: rsp - 8,
            error: PageFaultError::new().with_write(true).with_user(true),
        })
    );
    assert_eq!(m.state().rsp, KSTACK_TOP - 48);
    assert_eq!(m.frames().last().map(|d| d.frame.rsp()), Some(rsp));
}

#[test]
fn unusable_rsp0_escalates_to_double_fault_on_ist() {
    let world = World::new();
    let mut m = world.user_machine();
    assert!(m.view_mut().unmap(KSTACK_TOP - KERNEL_STACK_SIZE));

    let step = m.hardware_interrupt(TIMER_VECTOR);
    assert_eq!(step.fault(), Some(Fault::DoubleFault));
    let delivery = step.delivery().expect("#DF delivered");
    assert_eq!(delivery.vector, DOUBLE_FAULT_VECTOR);
    assert_eq!(delivery.error_code, Some(0));
    assert_eq!(delivery.stack_pointer, IST_TOP - 48);
    assert_eq!(delivery.frame, user_frame());

    assert_eq!(m.state().rip, handler(DOUBLE_FAULT_VECTOR));
    assert_eq!(m.state().cs, CodeSegment(KERNEL_CS));
    assert!(!m.is_shutdown());
}

#[test]
fn unset_ist_slot_faults_on_the_wrapped_push() {
    let idt = common::idt_builder()
        .handler_with(0x40, handler(0x40), GateType::InterruptGate, Ist::Ist2)
        .expect("IST gate")
        .build();
    let world = World::with_idt(idt);
    assert_eq!(world.task.ist(Ist::Ist2), Some(VirtualAddress::zero()));

    let mut m = world.machine();
    let step = m.software_interrupt(0x40);
    assert_eq!(
        step.fault(),
        Some(Fault::PageFault {
            address: VirtualAddress::new(0u64.wrapping_sub(40)),
            error: PageFaultError::new().with_write(true),
        })
    );
    let delivery = step.delivery().expect("#PF delivered");
    assert_eq!(delivery.vector, PAGE_FAULT_VECTOR);
    assert_eq!(m.state().rip, handler(PAGE_FAULT_VECTOR));
}

#[test]
fn fault_while_delivering_double_fault_shuts_down() {
    let world = World::new();
    let mut m = world.user_machine();
    assert!(m.view_mut().unmap(KSTACK_TOP - KERNEL_STACK_SIZE));
    assert!(m.view_mut().unmap(IST_TOP - IST_STACK_SIZE));

    let step = m.hardware_interrupt(TIMER_VECTOR);
    assert_eq!(step, Step::Shutdown);
    assert_eq!(step.fault(), Some(Fault::TripleFault));
    assert!(m.is_shutdown());

    assert_eq!(m.fetch(), Step::Shutdown);
    assert_eq!(m.software_interrupt(0x80), Step::Shutdown);
}

#[test]
fn kernel_handlers_do_not_run_from_user_pages() {
    let world = World::new();
    let mut m = world.user_machine();
    // Remap the handler page as user-accessible code.
    assert!(m.view_mut().unmap(HANDLERS));
    m.view_mut()
        .map(HANDLERS, 0x1000, PageWalk::leaf(PageEntryFlags::user_code()))
        .expect("remapped");

    assert!(matches!(m.hardware_interrupt(TIMER_VECTOR), Step::Entered(_)));
    let step = m.fetch();
    assert_eq!(
        step.fault(),
        Some(Fault::PageFault {
            address: handler(TIMER_VECTOR),
            error: PageFaultError::new()
                .with_present(true)
                .with_instruction_fetch(true),
        })
    );
    assert_eq!(m.state().ss, StackSegment(0));
}
