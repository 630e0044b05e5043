//! Runs test cases defined in `duet_test_suite`.
use duet_port_std::PortInstance;
use std::sync::atomic::{AtomicBool, Ordering};

struct KernelTestUtil {
    is_successful: AtomicBool,
}

impl KernelTestUtil {
    const fn new() -> Self {
        Self {
            is_successful: AtomicBool::new(false),
        }
    }

    fn success<Traits: PortInstance>(&self) {
        self.is_successful.store(true, Ordering::Relaxed);
        duet_port_std::shutdown::<Traits>();
    }

    fn fail(&self) {
        panic!("test failed");
    }

    fn run(&self, func: impl FnOnce()) {
        let _ = env_logger::try_init();

        if let Err(panic_info) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(func)) {
            std::panic::resume_unwind(panic_info);
        }

        if self.is_successful.load(Ordering::Relaxed) {
            return;
        }

        panic!("The program deadlocked without calling `success`");
    }
}

macro_rules! instantiate_kernel_tests {
    ( $(
        { path: $path:path, name_ident: $name_ident:ident, $($rest:tt)* },
    )* ) => {$(
        mod $name_ident {
            use duet_kernel::{IrqBank, IrqMask};
            use duet_test_suite::kernel_tests;
            use $path as test_case;

            duet_port_std::use_port!(unsafe struct SystemTraits);
            duet_kernel::build!(SystemTraits);

            struct Driver;
            static TEST_UTIL: super::KernelTestUtil = super::KernelTestUtil::new();
            static APP: test_case::App<SystemTraits> = test_case::App::new();

            impl kernel_tests::Driver<test_case::App<SystemTraits>> for Driver {
                type Traits = SystemTraits;

                fn app() -> &'static test_case::App<SystemTraits> {
                    &APP
                }

                fn success() {
                    TEST_UTIL.success::<SystemTraits>();
                }

                fn fail() {
                    TEST_UTIL.fail();
                }

                fn pend_irq(bank: IrqBank, mask: IrqMask) {
                    duet_port_std::pend_irq::<SystemTraits>(bank, mask);
                }

                fn advance_time(ticks: u32) {
                    duet_port_std::advance_tick::<SystemTraits>(ticks.into());
                }
            }

            #[test]
            fn run() {
                TEST_UTIL.run(|| {
                    port_std_impl::PORT_STATE.port_boot::<SystemTraits>(
                        test_case::main::<SystemTraits, Driver>,
                        0,
                    );
                });
            }
        }
    )*};
}

duet_test_suite::get_kernel_tests!(instantiate_kernel_tests!());
