//! xHCI 寄存器
//!
//! 引擎只通过 [`XhciRegisters`] 访问控制器；[`MmioRegisters`] 用 `xhci`
//! crate 的寄存器定义访问真实 MMIO。

use core::{num::NonZeroUsize, ptr::NonNull};

use spin::Mutex;
use xhci::{
    accessor::Mapper,
    registers::{doorbell, operational::PortStatusAndControlRegister},
};

use super::{
    event::EventRingInfo,
    port::{PortChanges, PortStatus},
};
use crate::{BusAddr, sync::IrqMask};

const HALT_POLL_LIMIT: usize = 16 * 1000;

/// Register operations the ring engine performs.
pub trait XhciRegisters: Send + Sync {
    fn max_ports(&self) -> u8;
    /// Writes doorbell `index` (0 = host controller, otherwise slot id).
    /// The command ring doorbell is target 0 on register 0.
    fn ring_doorbell(&self, index: u8, target: u8, stream_id: u16);
    fn set_command_ring(&self, addr: BusAddr, cycle: bool);
    fn setup_event_ring(&self, interrupter: u16, info: &EventRingInfo);
    /// Publishes the event ring dequeue pointer (with DESI in bits 0..3).
    /// With `clear_busy` the EHB bit is written as 1 to clear it, otherwise
    /// as 0 to leave it alone.
    fn write_erdp(&self, interrupter: u16, erdp: u64, clear_busy: bool);
    /// Clears IMAN.IP and USBSTS.EINT.
    fn ack_interrupt(&self, interrupter: u16);
    /// Reads PORTSC of a 1-based port and clears the change bits it saw.
    fn ack_port_changes(&self, port_id: u8) -> PortStatus;
    fn host_system_error(&self) -> bool;
    fn set_interrupts(&self, interrupter: u16, enable: bool);
    fn run(&self);
    /// Clears Run/Stop and waits for HCHalted. Returns whether it halted.
    fn halt(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct MemMapper;

impl Mapper for MemMapper {
    unsafe fn map(&mut self, phys_start: usize, _bytes: usize) -> NonZeroUsize {
        unsafe { NonZeroUsize::new_unchecked(phys_start) }
    }

    fn unmap(&mut self, _virt_start: usize, _bytes: usize) {}
}

type Registers = xhci::Registers<MemMapper>;

/// [`XhciRegisters`] over the controller's MMIO window, identity mapped.
pub struct MmioRegisters {
    mmio_base: usize,
    reg: Mutex<Registers>,
}

unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    ///
    /// `mmio_base` must map the controller's whole MMIO window.
    pub unsafe fn new(mmio_base: NonNull<u8>) -> Self {
        let mmio_base = mmio_base.as_ptr() as usize;
        let reg = unsafe { Registers::new(mmio_base, MemMapper) };
        debug!("xhci mmio @{mmio_base:#x}");
        Self {
            mmio_base,
            reg: Mutex::new(reg),
        }
    }

    pub fn mmio_base(&self) -> usize {
        self.mmio_base
    }

    pub fn max_slots(&self) -> u8 {
        self.reg
            .lock()
            .capability
            .hcsparams1
            .read_volatile()
            .number_of_device_slots()
    }

    pub fn set_dcbaap(&self, addr: BusAddr) {
        self.reg
            .lock()
            .operational
            .dcbaap
            .update_volatile(|r| r.set(addr.raw()));
    }
}

fn port_status(sc: &PortStatusAndControlRegister) -> PortStatus {
    let mut changes = PortChanges::empty();
    changes.set(PortChanges::CONNECT, sc.connect_status_change());
    changes.set(PortChanges::ENABLE, sc.port_enabled_disabled_change());
    changes.set(PortChanges::WARM_RESET, sc.warm_port_reset_change());
    changes.set(PortChanges::OVER_CURRENT, sc.over_current_change());
    changes.set(PortChanges::RESET, sc.port_reset_change());
    changes.set(PortChanges::LINK_STATE, sc.port_link_state_change());
    changes.set(PortChanges::CONFIG_ERROR, sc.port_config_error_change());
    PortStatus {
        connected: sc.current_connect_status(),
        enabled: sc.port_enabled_disabled(),
        powered: sc.port_power(),
        over_current: sc.over_current_active(),
        speed: sc.port_speed(),
        link_state: sc.port_link_state(),
        changes,
    }
}

impl XhciRegisters for MmioRegisters {
    fn max_ports(&self) -> u8 {
        self.reg
            .lock()
            .capability
            .hcsparams1
            .read_volatile()
            .number_of_ports()
    }

    fn ring_doorbell(&self, index: u8, target: u8, stream_id: u16) {
        trace!("doorbell[{index}] <- target {target} stream {stream_id}");
        let mut bell = doorbell::Register::default();
        bell.set_doorbell_target(target);
        bell.set_doorbell_stream_id(stream_id);
        self.reg
            .lock()
            .doorbell
            .write_volatile_at(index as usize, bell);
    }

    fn set_command_ring(&self, addr: BusAddr, cycle: bool) {
        debug!("CRCR: {addr:#x}");
        self.reg.lock().operational.crcr.update_volatile(|r| {
            r.set_command_ring_pointer(addr.raw());
            if cycle {
                r.set_ring_cycle_state();
            } else {
                r.clear_ring_cycle_state();
            }
        });
    }

    fn setup_event_ring(&self, interrupter: u16, info: &EventRingInfo) {
        let mut reg = self.reg.lock();
        let mut ir = reg
            .interrupter_register_set
            .interrupter_mut(interrupter as usize);
        debug!("ERSTZ: {:#x}", info.erstz);
        ir.erstsz.update_volatile(|r| r.set(info.erstz));
        debug!("ERDP: {:#x}", info.erdp);
        ir.erdp.update_volatile(|r| {
            r.set_event_ring_dequeue_pointer(info.erdp & !0xf);
            r.set_dequeue_erst_segment_index((info.erdp & 0x7) as u8);
        });
        // ERSTBA 写入后控制器开始使用事件环
        debug!("ERSTBA: {:#x}", info.erstba);
        ir.erstba.update_volatile(|r| r.set(info.erstba));
    }

    fn write_erdp(&self, interrupter: u16, erdp: u64, clear_busy: bool) {
        let mut reg = self.reg.lock();
        let mut ir = reg
            .interrupter_register_set
            .interrupter_mut(interrupter as usize);
        ir.erdp.update_volatile(|r| {
            // EHB 是 RW1C，读回的 1 原样写回会把它清掉
            *r = Default::default();
            r.set_event_ring_dequeue_pointer(erdp & !0xf);
            r.set_dequeue_erst_segment_index((erdp & 0x7) as u8);
            if clear_busy {
                r.clear_event_handler_busy();
            }
        });
    }

    fn ack_interrupt(&self, interrupter: u16) {
        let mut reg = self.reg.lock();
        reg.interrupter_register_set
            .interrupter_mut(interrupter as usize)
            .iman
            .update_volatile(|r| {
                r.clear_interrupt_pending();
            });
        reg.operational.usbsts.update_volatile(|r| {
            // 只清 EINT，HSE、PCD 等留给各自的处理
            // SAFETY: UsbStatusRegister is a repr(transparent) u32; all-zero is valid.
            *r = unsafe { core::mem::zeroed() };
            r.clear_event_interrupt();
        });
    }

    fn ack_port_changes(&self, port_id: u8) -> PortStatus {
        let idx = port_id.saturating_sub(1) as usize;
        let mut reg = self.reg.lock();
        let sc = reg.port_register_set.read_volatile_at(idx).portsc;
        let status = port_status(&sc);
        if sc.port_reset() {
            // PR 是 RW1S，复位期间写回会重新触发复位
            debug!("port {port_id} in reset, change bits left set");
            return status;
        }
        reg.port_register_set.update_volatile_at(idx, |p| {
            // 写回读到的快照：看到的变化位被清除，之后新置的不受影响
            p.portsc = sc;
            p.portsc.set_0_port_enabled_disabled();
        });
        status
    }

    fn host_system_error(&self) -> bool {
        self.reg
            .lock()
            .operational
            .usbsts
            .read_volatile()
            .host_system_error()
    }

    fn set_interrupts(&self, interrupter: u16, enable: bool) {
        let mut reg = self.reg.lock();
        if enable {
            reg.interrupter_register_set
                .interrupter_mut(interrupter as usize)
                .iman
                .update_volatile(|r| {
                    r.set_interrupt_enable();
                });
            reg.operational.usbcmd.update_volatile(|r| {
                r.set_interrupter_enable();
                r.set_host_system_error_enable();
            });
        } else {
            reg.operational.usbcmd.update_volatile(|r| {
                r.clear_interrupter_enable();
            });
            reg.interrupter_register_set
                .interrupter_mut(interrupter as usize)
                .iman
                .update_volatile(|r| {
                    r.clear_interrupt_enable();
                });
        }
    }

    fn run(&self) {
        self.reg.lock().operational.usbcmd.update_volatile(|r| {
            r.set_run_stop();
        });
        debug!("Start run");
    }

    fn halt(&self) -> bool {
        let mut reg = self.reg.lock();
        reg.operational.usbcmd.update_volatile(|r| {
            r.clear_run_stop();
        });
        for _ in 0..HALT_POLL_LIMIT {
            if reg.operational.usbsts.read_volatile().hc_halted() {
                return true;
            }
            core::hint::spin_loop();
        }
        error!("xhci did not halt");
        false
    }
}

impl IrqMask for MmioRegisters {
    fn disable(&self) -> bool {
        let mut enable = true;
        self.reg.lock().operational.usbcmd.update_volatile(|r| {
            enable = r.interrupter_enable();
            r.clear_interrupter_enable();
        });
        enable
    }

    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            self.reg.lock().operational.usbcmd.update_volatile(|r| {
                r.set_interrupter_enable();
            });
        }
    }
}
