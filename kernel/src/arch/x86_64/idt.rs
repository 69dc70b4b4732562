// Interrupt descriptor table and legacy PIC wiring.
//
// Exception vectors here are last-resort diagnostics; the kernel treats
// any of them firing as an invariant violation. The two IRQ lines the
// core runtime consumes (PIT tick, keyboard byte) are dispatched to the
// named handlers the subsystems export.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const IRQ_TIMER: u8 = PIC_1_OFFSET;
const IRQ_KEYBOARD: u8 = PIC_1_OFFSET + 1;

static PICS: Mutex<ChainedPics> =
    // SAFETY: standard remap offsets 32/40, clear of CPU exceptions.
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt[IRQ_TIMER].set_handler_fn(timer_interrupt_handler);
        idt[IRQ_KEYBOARD].set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
    // SAFETY: remaps the PICs and unmasks the lines; the IDT above has
    // handlers installed for every vector the PICs can now raise.
    unsafe {
        PICS.lock().initialize();
    }
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:?}", Cr2::read());
    println!("Error Code: {:?}", error_code);
    println!("{:#?}", stack_frame);
    panic!("page fault in kernel space");
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    println!("EXCEPTION: GENERAL PROTECTION FAULT");
    println!("Error Code: {:#x}", error_code);
    println!("{:#?}", stack_frame);
    panic!("general protection fault");
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // EOI before the tick: the tick may context-switch away and the new
    // task must not inherit a pending unacknowledged interrupt.
    // SAFETY: acknowledging the vector this handler was entered for.
    unsafe {
        PICS.lock().notify_end_of_interrupt(IRQ_TIMER);
    }
    super::pit::tick();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let mut data_port: Port<u8> = Port::new(0x60);
    // SAFETY: reading the PS/2 data port inside its own IRQ handler.
    let scancode = unsafe { data_port.read() };

    // SAFETY: acknowledging the vector this handler was entered for.
    unsafe {
        PICS.lock().notify_end_of_interrupt(IRQ_KEYBOARD);
    }
    crate::drivers::keyboard::handle_scancode(scancode);
}
