//! Tests for the shared value types

use xedbg_core::types::{ConditionField, GuestAddress, GuestContext, HostAddress, ThreadId};

#[test]
fn test_guest_address_arithmetic()
{
    let pc = GuestAddress::new(0x8200_0000);
    assert_eq!((pc + 8).value(), 0x8200_0008);
    assert_eq!((pc - 4).value(), 0x81FF_FFFC);
    assert_eq!(pc.offset(-0x10).value(), 0x81FF_FFF0);
    assert_eq!(GuestAddress::new(0xFFFF_FFFC).next_instruction(), GuestAddress::ZERO);
}

#[test]
fn test_guest_address_conversions()
{
    let pc = GuestAddress::from(0x8200_1234);
    let raw: u32 = pc.into();
    assert_eq!(raw, 0x8200_1234);
    assert_eq!(pc.to_string(), "0x82001234");
    assert!(GuestAddress::ZERO.is_zero());
}

#[test]
fn test_guest_address_ordering()
{
    let low = GuestAddress::new(0x100);
    let high = GuestAddress::new(0x200);
    assert!(low < high);
    assert_eq!(low.max(high), high);
}

#[test]
fn test_host_address()
{
    let pc = HostAddress::new(0x1_8200_0000);
    assert_eq!((pc + 4).value(), 0x1_8200_0004);
    assert_eq!(pc.to_string(), "0x0000000182000000");
    assert_eq!(HostAddress::new(u64::MAX).checked_add(1), None);
}

#[test]
fn test_thread_id()
{
    let id = ThreadId::from(12);
    assert_eq!(id.raw(), 12);
    assert_eq!(id.to_string(), "#12");
    assert_eq!(id, ThreadId(12));
    assert_ne!(id, ThreadId(13));
}

#[test]
fn test_guest_context_register_targets_are_raw()
{
    let context = GuestContext {
        lr: 0x1_8200_0013,
        ctr: 0x8200_0022,
        ..GuestContext::default()
    };
    assert_eq!(context.link_target(), GuestAddress::new(0x8200_0013));
    assert_eq!(context.count_target(), GuestAddress::new(0x8200_0022));
}

#[test]
fn test_condition_fields()
{
    let mut context = GuestContext::default();
    context.set_cr_field(2, ConditionField::compare(-1, 0));
    let field = context.cr_field(2);
    assert!(field.lt);
    assert!(!field.eq);
    // cr2.lt is condition bit 8
    assert!(context.cr_bit(8));
    assert!(!context.cr_bit(0));
}
