use kernel_privilege::address::VirtualAddress;
use kernel_privilege::gdt::selectors::{DataSel, InvalidSelector, SegmentSelector};
use kernel_privilege::gdt::{USER_CS_SEL, USER_DS_SEL};
use kernel_privilege::privilege::{Dpl, Ring, Rpl};
use kernel_privilege::stack::{PageEntryFlags, PageWalk};
use kernel_privilege::transition::UserEntry;
use kernel_registers::Rflags;
use proptest::prelude::*;

fn entry_flags() -> impl Strategy<Value = PageEntryFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(p, w, u, nx)| {
        PageEntryFlags::new()
            .with_present(p)
            .with_writable(w)
            .with_user_access(u)
            .with_no_execute(nx)
    })
}

fn dpl() -> impl Strategy<Value = Dpl> {
    prop_oneof![Just(Dpl::Ring0), Just(Dpl::Ring3)]
}

fn ring() -> impl Strategy<Value = Ring> {
    prop_oneof![Just(Ring::Ring0), Just(Ring::Ring3)]
}

proptest! {
    #[test]
    fn only_rings_0_and_3_build_selectors(index in 1u16..8192, ring in any::<u8>()) {
        let sel = SegmentSelector::<DataSel>::try_new(index, ring);
        if ring == 0 || ring == 3 {
            let sel = sel.expect("valid ring");
            prop_assert_eq!(sel.encode(), (index << 3) | u16::from(ring));
            prop_assert_eq!(sel.index(), index);
        } else {
            prop_assert_eq!(sel.err(), Some(InvalidSelector::Rpl(ring)));
        }
    }

    #[test]
    fn decoded_selectors_reencode_unchanged(raw in any::<u16>()) {
        let valid = raw & 0b100 == 0 && matches!(raw & 0b11, 0 | 3) && raw >> 3 != 0;
        match SegmentSelector::<DataSel>::decode(raw) {
            Ok(sel) => {
                prop_assert!(valid);
                prop_assert_eq!(sel.encode(), raw);
                prop_assert_eq!(sel.rpl().into_bits(), raw & 0b11);
            }
            Err(_) => prop_assert!(!valid),
        }
    }

    #[test]
    fn user_entry_frame_is_fixed_apart_from_rip_and_rsp(
        rip in 0u64..=VirtualAddress::USER_END,
        rsp in 0u64..=VirtualAddress::USER_END,
    ) {
        let entry = UserEntry::new(
            VirtualAddress::new(rip),
            VirtualAddress::new(rsp),
            USER_CS_SEL,
            USER_DS_SEL,
        )
        .expect("lower-half addresses");
        prop_assert_eq!(entry.frame().push_order(), [0x23, rsp, 0x202, 0x1B, rip]);
        prop_assert_eq!(entry.frame().ring(), Ring::Ring3);
    }

    #[test]
    fn upper_half_entry_points_are_refused(rip in (VirtualAddress::USER_END + 1)..=u64::MAX) {
        let result = UserEntry::new(
            VirtualAddress::new(rip),
            VirtualAddress::new(0x7FFF_0000),
            USER_CS_SEL,
            USER_DS_SEL,
        );
        prop_assert!(result.is_err());
    }

    #[test]
    fn effective_permissions_combine_every_level(
        levels in proptest::array::uniform4(entry_flags()),
    ) {
        let p = PageWalk::new(levels).effective();
        prop_assert_eq!(p.present, levels.iter().all(|l| l.present()));
        prop_assert_eq!(p.writable, levels.iter().all(|l| l.writable()));
        prop_assert_eq!(p.user, levels.iter().all(|l| l.user_access()));
        prop_assert_eq!(p.executable, !levels.iter().any(|l| l.no_execute()));
    }

    #[test]
    fn software_invocation_needs_cpl_at_most_dpl(dpl in dpl(), cpl in ring()) {
        prop_assert_eq!(
            dpl.permits_software_invocation(cpl),
            cpl.to_u8() <= dpl.into_bits()
        );
    }

    #[test]
    fn normalized_flags_keep_fixed_bits(raw in any::<u64>()) {
        let bits = Rflags::normalized(raw).into_bits();
        prop_assert_eq!(bits & Rflags::RESERVED_ONE, Rflags::RESERVED_ONE);
        prop_assert_eq!(bits & Rflags::RESERVED_ZERO, 0);
        prop_assert_eq!(bits, (raw | Rflags::RESERVED_ONE) & !Rflags::RESERVED_ZERO);
    }

    #[test]
    fn rpl_replaces_only_the_low_bits(
        selector in any::<u16>(),
        rpl in prop_oneof![Just(Rpl::Ring0), Just(Rpl::Ring3)],
    ) {
        let applied = rpl.apply_to_selector(selector);
        prop_assert_eq!(Rpl::from_selector(applied), Ok(rpl));
        prop_assert_eq!(applied & !0b11, selector & !0b11);
    }
}
